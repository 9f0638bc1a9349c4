use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::app::{AppState, Notice};
use crate::backend::RegistrationBackend;
use crate::error::{ConsoleError, Result};
use crate::resolver::{ScanFocus, ScanLog, ScanRecord};
use crate::saving;
use crate::store::RegistrationStore;

pub const SESSION_COOKIE: &str = "session";
const SESSION_DURATION: u64 = 24 * 60 * 60; // 24 hours in seconds

/// Console view chosen at login. Switching requires logging in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminMode {
    Dashboard,
    Attendance,
}

impl AdminMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminMode::Dashboard => "dashboard",
            AdminMode::Attendance => "attendance",
        }
    }
}

/// Stored admin credential, keyed by synthetic email in `admins.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminAccount {
    pub email: String,

    /// Argon2 hash of the password
    pub password_hash: String,
}

/// The admin account file.
pub struct AdminDirectory {
    path: PathBuf,
    domain: String,
}

impl AdminDirectory {
    pub fn new(path: PathBuf, domain: &str) -> Self {
        AdminDirectory {
            path,
            domain: domain.to_string(),
        }
    }

    /// Usernames are mapped to `{username}@{domain}` before any lookup.
    pub fn email_for(&self, username: &str) -> String {
        format!("{}@{}", username.trim().to_lowercase(), self.domain)
    }

    fn accounts(&self) -> Result<HashMap<String, AdminAccount>> {
        Ok(saving::load_json(&self.path)?.unwrap_or_default())
    }

    /// Create or replace the account for `username`
    ///
    /// # Errors
    /// * Returns an error if either field is empty or the file cannot be written
    pub fn add_admin(&self, username: &str, password: &str) -> Result<String> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(ConsoleError::Malformed(
                "Username and password cannot be empty".to_string(),
            ));
        }
        let email = self.email_for(username);
        let mut accounts = self.accounts()?;
        accounts.insert(
            email.clone(),
            AdminAccount {
                email: email.clone(),
                password_hash: hash_password(password)?,
            },
        );
        saving::save_json(&accounts, &self.path)?;
        log::info!("Saved admin account {}", email);
        Ok(email)
    }

    pub fn verify(&self, username: &str, password: &str) -> Result<bool> {
        let accounts = self.accounts()?;
        match accounts.get(&self.email_for(username)) {
            Some(account) => verify_password(password, &account.password_hash),
            None => Ok(false),
        }
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| ConsoleError::Storage("Password hashing failed".to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| ConsoleError::Storage("Invalid password hash format".to_string()))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false), // Password didn't match
    }
}

/// State of one logged-in admin.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub username: String,
    pub mode: AdminMode,
    pub expires_at: SystemTime,

    /// Event attendance is being taken for (attendance mode)
    pub active_event: Option<String>,

    /// Member selected by the last successful scan
    pub focus: Option<ScanFocus>,

    pub scans: ScanLog,
}

impl AdminSession {
    pub fn record(&mut self, record: ScanRecord) {
        self.scans.push(record);
    }
}

/// Identity attached to an authenticated request by [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentAdmin {
    pub session_id: String,
    pub username: String,
    pub mode: AdminMode,
}

impl CurrentAdmin {
    /// Fail with `Forbidden` unless the session was opened in `mode`.
    pub fn require_mode(&self, mode: AdminMode) -> Result<()> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(ConsoleError::Forbidden(self.mode.as_str().to_string()))
        }
    }
}

/// Gate in front of every admin operation
///
/// Owns the sessions and ties the registration feed to them: the feed is
/// attached while at least one session is alive and detached (cache cleared)
/// when the last one ends.
pub struct SessionGate {
    directory: AdminDirectory,
    sessions: RwLock<HashMap<String, AdminSession>>,
    store: RegistrationStore,
    backend: Arc<dyn RegistrationBackend>,
}

impl SessionGate {
    pub fn new(
        directory: AdminDirectory,
        store: RegistrationStore,
        backend: Arc<dyn RegistrationBackend>,
    ) -> Self {
        SessionGate {
            directory,
            sessions: RwLock::new(HashMap::new()),
            store,
            backend,
        }
    }

    pub fn directory(&self) -> &AdminDirectory {
        &self.directory
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AdminSession>> {
        match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AdminSession>> {
        match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check credentials and open a session
    ///
    /// # Arguments
    /// * `username` - Admin username, without domain
    /// * `password` - Plain text password
    /// * `mode` - View the session is locked to
    ///
    /// # Returns
    /// * `Result<String>` - The new session id
    ///
    /// # Errors
    /// * `Unauthorized` for an unknown user or a wrong password
    pub fn login(&self, username: &str, password: &str, mode: AdminMode) -> Result<String> {
        if !self.directory.verify(username, password)? {
            log::warn!("Rejected login for {}", username);
            return Err(ConsoleError::Unauthorized(
                "Invalid username or password".to_string(),
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        let session = AdminSession {
            username: username.trim().to_lowercase(),
            mode,
            expires_at: SystemTime::now() + Duration::from_secs(SESSION_DURATION),
            active_event: None,
            focus: None,
            scans: ScanLog::default(),
        };

        let mut sessions = self.write();
        purge_expired(&mut sessions);
        sessions.insert(session_id.clone(), session);
        if !self.store.is_attached() {
            self.store.attach(self.backend.clone());
        }
        log::info!("{} logged in ({} mode)", username, mode.as_str());
        Ok(session_id)
    }

    /// End a session. Returns false if it did not exist.
    pub fn logout(&self, session_id: &str) -> bool {
        let mut sessions = self.write();
        let removed = sessions.remove(session_id);
        if let Some(session) = &removed {
            log::info!("{} logged out", session.username);
        }
        self.detach_if_idle(&sessions);
        removed.is_some()
    }

    fn detach_if_idle(&self, sessions: &HashMap<String, AdminSession>) {
        if sessions.is_empty() && self.store.is_attached() {
            self.store.detach();
        }
    }

    /// Look up a live session, dropping it if it has expired.
    pub fn validate(&self, session_id: &str) -> Option<CurrentAdmin> {
        {
            let sessions = self.read();
            match sessions.get(session_id) {
                None => return None,
                Some(s) if s.expires_at > SystemTime::now() => {
                    return Some(CurrentAdmin {
                        session_id: session_id.to_string(),
                        username: s.username.clone(),
                        mode: s.mode,
                    });
                }
                Some(_) => {}
            }
        }

        let mut sessions = self.write();
        purge_expired(&mut sessions);
        self.detach_if_idle(&sessions);
        None
    }

    /// Drop every expired session, detaching the feed if none is left
    ///
    /// # Returns
    /// * `usize` - Number of sessions removed
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.write();
        let removed = purge_expired(&mut sessions);
        if removed > 0 {
            self.detach_if_idle(&sessions);
        }
        removed
    }

    /// Run `f` on the session's state, if the session still exists.
    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut AdminSession) -> R) -> Option<R> {
        self.write().get_mut(session_id).map(f)
    }

    pub fn session(&self, session_id: &str) -> Option<AdminSession> {
        self.read().get(session_id).cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.read().len()
    }
}

fn purge_expired(sessions: &mut HashMap<String, AdminSession>) -> usize {
    let now = SystemTime::now();
    let before = sessions.len();
    sessions.retain(|_, s| s.expires_at > now);
    let removed = before - sessions.len();
    if removed > 0 {
        log::info!("Expired {} session(s)", removed);
    }
    removed
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub mode: AdminMode,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub username: String,
    pub mode: AdminMode,
    pub active_event: Option<String>,
}

/// Handle admin login
///
/// Sets the `session` cookie on success.
pub async fn handle_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state
        .gate
        .login(&request.username, &request.password, request.mode)
    {
        Ok(session_id) => {
            let cookie = Cookie::build((SESSION_COOKIE, session_id))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Strict)
                .build();
            let info = SessionInfo {
                username: request.username.trim().to_lowercase(),
                mode: request.mode,
                active_event: None,
            };
            (
                jar.add(cookie),
                Json(Notice::success("Logged in").with_data(info)),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Handle logout: end the session and clear the cookie.
pub async fn handle_logout(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    jar: CookieJar,
) -> (CookieJar, Json<Notice>) {
    state.gate.logout(&admin.session_id);
    state.release_scanner(&admin.session_id).await;
    let cookie = Cookie::build((SESSION_COOKIE, "")).path("/").build();
    (jar.remove(cookie), Json(Notice::info("Logged out")))
}

pub async fn handle_session(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Response {
    match state.gate.session(&admin.session_id) {
        Some(session) => Json(SessionInfo {
            username: session.username,
            mode: session.mode,
            active_event: session.active_event,
        })
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Routes reachable without a session: login and the public registration form.
fn is_public(request: &Request) -> bool {
    let path = request.uri().path();
    path == "/api/login" || (path == "/api/registrations" && request.method() == Method::POST)
}

/// Authentication middleware
///
/// Passes the request on with a [`CurrentAdmin`] extension when the session
/// cookie is valid; answers 401 otherwise.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if is_public(&request) {
        return next.run(request).await;
    }

    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Some(admin) = state.gate.validate(cookie.value()) {
            request.extensions_mut().insert(admin);
            return next.run(request).await;
        }
    }

    ConsoleError::Unauthorized("Please log in".to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JsonFileBackend;

    fn gate(dir: &tempfile::TempDir) -> SessionGate {
        let directory = AdminDirectory::new(dir.path().join("admins.json"), "desk.test");
        directory.add_admin("Staff", "s3cret").unwrap();
        SessionGate::new(
            directory,
            RegistrationStore::new(),
            Arc::new(JsonFileBackend::in_memory()),
        )
    }

    #[test]
    fn usernames_map_to_synthetic_email() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(&dir);
        assert_eq!(g.directory().email_for(" Staff "), "staff@desk.test");
        assert!(g.directory().verify("staff", "s3cret").unwrap());
        assert!(!g.directory().verify("staff", "wrong").unwrap());
        assert!(!g.directory().verify("nobody", "s3cret").unwrap());
        assert!(g.directory().add_admin("", "x").is_err());
    }

    #[tokio::test]
    async fn feed_follows_session_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(&dir);
        assert!(!g.store.is_attached());

        let first = g.login("staff", "s3cret", AdminMode::Dashboard).unwrap();
        let second = g.login("staff", "s3cret", AdminMode::Attendance).unwrap();
        assert!(g.store.is_attached());
        assert_eq!(g.validate(&second).unwrap().mode, AdminMode::Attendance);

        assert!(g.logout(&first));
        assert!(g.store.is_attached());
        assert!(g.logout(&second));
        assert!(!g.store.is_attached());
        assert!(!g.logout(&second));
        assert!(g.validate(&second).is_none());
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(&dir);
        let err = g.login("staff", "nope", AdminMode::Dashboard).unwrap_err();
        assert!(matches!(err, ConsoleError::Unauthorized(_)));
        assert_eq!(g.active_sessions(), 0);
        assert!(!g.store.is_attached());
    }

    #[tokio::test]
    async fn expired_session_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(&dir);
        let id = g.login("staff", "s3cret", AdminMode::Dashboard).unwrap();
        g.with_session(&id, |s| s.expires_at = SystemTime::now() - Duration::from_secs(1));

        assert!(g.validate(&id).is_none());
        assert_eq!(g.active_sessions(), 0);
        assert!(!g.store.is_attached());
    }

    #[tokio::test]
    async fn abandoned_sessions_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let g = gate(&dir);
        let stale = g.login("staff", "s3cret", AdminMode::Dashboard).unwrap();
        let expire = |id: &str| {
            g.with_session(id, |s| s.expires_at = SystemTime::now() - Duration::from_secs(1));
        };
        expire(&stale);

        let fresh = g.login("staff", "s3cret", AdminMode::Attendance).unwrap();
        assert_eq!(g.active_sessions(), 1);
        assert!(g.session(&stale).is_none());

        expire(&fresh);
        assert_eq!(g.sweep_expired(), 1);
        assert_eq!(g.active_sessions(), 0);
        assert!(!g.store.is_attached());
        assert_eq!(g.sweep_expired(), 0);
    }

    #[test]
    fn mode_is_enforced() {
        let admin = CurrentAdmin {
            session_id: "s".to_string(),
            username: "staff".to_string(),
            mode: AdminMode::Attendance,
        };
        assert!(admin.require_mode(AdminMode::Attendance).is_ok());
        assert!(matches!(
            admin.require_mode(AdminMode::Dashboard),
            Err(ConsoleError::Forbidden(_))
        ));
    }
}
