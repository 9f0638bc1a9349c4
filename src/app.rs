use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt, wrappers::WatchStream};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::attendance::{AttendanceDesk, MutationOutcome, PresentMember, present_members};
use crate::backend::{JsonFileBackend, RegistrationBackend};
use crate::config::ConsoleConfig;
use crate::device::LineDevice;
use crate::downloader::{self, HttpQrSource, ReportPlan};
use crate::error::{ConsoleError, Result};
use crate::login::{self, AdminDirectory, AdminMode, CurrentAdmin, SessionGate};
use crate::mailer::Mailer;
use crate::notify::{self, Notifier};
use crate::payload::{DISPLAY_QR_SIZE, QrEndpoint, ScanPayload};
use crate::registration::{NewRegistration, Registration, RegistrationStatus, TeamMember};
use crate::resolver::{Readiness, ScanFocus, ScanOutcome, ScanRecord, assess, resolve_scan};
use crate::scanner::{INSECURE_CONTEXT_MESSAGE, ScanEvents, ScannerSession, ScannerState};
use crate::store::RegistrationStore;
use crate::summary::{self, DashboardStats};

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const CRASH_MESSAGE: &str = "Something went wrong. Please reload.";
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Success,
    Error,
    Info,
}

/// The transient notification every mutating endpoint answers with.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Notice {
    fn new(level: Level, message: impl Into<String>) -> Self {
        Notice {
            level,
            message: message.into(),
            data: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Notice::new(Level::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Notice::new(Level::Error, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Notice::new(Level::Info, message)
    }

    pub fn with_data<T: Serialize>(mut self, data: T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status = match &self {
            ConsoleError::NotFound(_) | ConsoleError::MemberNotFound { .. } => StatusCode::NOT_FOUND,
            ConsoleError::Malformed(_) | ConsoleError::Json(_) => StatusCode::BAD_REQUEST,
            ConsoleError::PaymentNotVerified(_)
            | ConsoleError::NotRegistered { .. }
            | ConsoleError::ScannerBusy => StatusCode::CONFLICT,
            ConsoleError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConsoleError::Forbidden(_) => StatusCode::FORBIDDEN,
            ConsoleError::Mail(_) => StatusCode::BAD_GATEWAY,
            ConsoleError::Camera(_) => StatusCode::SERVICE_UNAVAILABLE,
            ConsoleError::Storage(_)
            | ConsoleError::Io(_)
            | ConsoleError::Export(_)
            | ConsoleError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("{}", self);
        }
        (status, Json(Notice::error(self.to_string()))).into_response()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConsoleConfig>,
    pub backend: Arc<dyn RegistrationBackend>,
    pub store: RegistrationStore,
    pub desk: AttendanceDesk,
    pub gate: Arc<SessionGate>,
    pub notifier: Arc<Notifier<Mailer>>,
    pub qr: QrEndpoint,
    pub images: Arc<HttpQrSource>,
    pub scanner: Arc<tokio::sync::Mutex<ScannerSession<LineDevice>>>,
    /// Session that opened the scanner; device scans are applied to it
    scanner_owner: Arc<Mutex<Option<String>>>,
    last_scan: Arc<Mutex<Option<ScanReport>>>,
}

impl AppState {
    /// Wire every component from `config`
    ///
    /// # Returns
    /// * `Result<(AppState, ScanEvents)>` - The state and the receiving end of
    ///   the scanner, to be handed to [`spawn_scan_consumer`]
    pub fn new(config: ConsoleConfig, backend: Arc<dyn RegistrationBackend>) -> Result<(Self, ScanEvents)> {
        let store = RegistrationStore::new();
        let desk = AttendanceDesk::new(backend.clone());
        let gate = SessionGate::new(
            AdminDirectory::new(config.admins_file(), &config.admin_email_domain),
            store.clone(),
            backend.clone(),
        );
        let qr = QrEndpoint::new(&config.qr_endpoint);
        let notifier = Notifier::new(
            Mailer::new(config.smtp.as_ref())?,
            qr.clone(),
            config.event.clone(),
            Duration::from_millis(config.email_delay_ms),
        );
        let (scanner, events) = ScannerSession::new(LineDevice::new(&config.scanner));

        let state = AppState {
            config: Arc::new(config),
            backend,
            store,
            desk,
            gate: Arc::new(gate),
            notifier: Arc::new(notifier),
            qr,
            images: Arc::new(HttpQrSource::new(reqwest::Client::new())),
            scanner: Arc::new(tokio::sync::Mutex::new(scanner)),
            scanner_owner: Arc::new(Mutex::new(None)),
            last_scan: Arc::new(Mutex::new(None)),
        };
        Ok((state, events))
    }

    fn scanner_owner(&self) -> Option<String> {
        lock(&self.scanner_owner).clone()
    }

    /// Another session's open scanner may not be driven from `session_id`.
    fn check_scanner_owner(&self, session_id: &str) -> Result<()> {
        match self.scanner_owner() {
            Some(owner) if owner != session_id => Err(ConsoleError::ScannerBusy),
            _ => Ok(()),
        }
    }

    /// Close the scanner if `session_id` is the session using it.
    pub async fn release_scanner(&self, session_id: &str) {
        let owned = {
            let mut owner = lock(&self.scanner_owner);
            if owner.as_deref() == Some(session_id) {
                *owner = None;
                true
            } else {
                false
            }
        };
        if owned {
            self.scanner.lock().await.close().await;
        }
    }
}

/// Result of handling one decoded QR text.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub notice: Notice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
    /// The scanner is closed after a hit in attendance mode
    #[serde(skip)]
    close_scanner: bool,
}

/// Classify `raw` for a session and update its focus and scan log
///
/// Returns `None` if the session no longer exists.
pub fn process_scan(state: &AppState, session_id: &str, raw: &str) -> Option<ScanReport> {
    let snapshot = state.store.snapshot();
    let outcome = resolve_scan(raw, &snapshot);
    log::debug!("Scan classified as {:?}", outcome);

    state.gate.with_session(session_id, |session| {
        let mut readiness = None;
        let mut close_scanner = false;

        let notice = match &outcome {
            ScanOutcome::Selected(focus) => {
                session.focus = Some(focus.clone());
                let reg = snapshot.iter().find(|r| r.id == focus.registration_id);
                let name = reg
                    .and_then(|r| r.roster().get(focus.member_index).map(|m| m.name.clone()))
                    .unwrap_or_default();
                let mut notice = Notice::success(format!("Participant found: {}", name));

                if session.mode == AdminMode::Attendance {
                    close_scanner = true;
                    if let (Some(event), Some(reg)) = (session.active_event.clone(), reg) {
                        let ready = assess(reg, focus.member_index, &event);
                        match ready {
                            Readiness::NotRegistered => {
                                notice = Notice::error(format!("{} is not registered for {}", name, event));
                                session.record(ScanRecord::new(&name, &event, false, "Not Registered"));
                            }
                            Readiness::AlreadyPresent => {
                                notice = Notice::info("Already marked present");
                            }
                            _ => {}
                        }
                        readiness = Some(ready);
                    }
                }
                notice
            }
            other => Notice::error(other.message()),
        };

        ScanReport {
            outcome: outcome.clone(),
            notice,
            readiness,
            close_scanner,
        }
    })
}

/// Drain device scans into the session that owns the scanner
///
/// After each scan the scanner either resumes or, for an attendance-mode hit,
/// closes.
pub fn spawn_scan_consumer(state: AppState, mut events: ScanEvents) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = events.recv().await {
            let Some(owner) = state.scanner_owner() else {
                log::debug!("Dropping scan with no scanner owner");
                continue;
            };
            match process_scan(&state, &owner, &raw) {
                Some(report) => {
                    {
                        let mut scanner = state.scanner.lock().await;
                        if report.close_scanner {
                            scanner.close().await;
                        } else {
                            scanner.resume();
                        }
                    }
                    *lock(&state.last_scan) = Some(report);
                }
                None => state.release_scanner(&owner).await,
            }
        }
    })
}

/// Periodically drop sessions whose cookie was never presented again.
pub fn spawn_session_sweeper(gate: Arc<SessionGate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            gate.sweep_expired();
        }
    })
}

/// Build the console router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/login", post(login::handle_login))
        .route("/api/logout", post(login::handle_logout))
        .route("/api/session", get(login::handle_session))
        .route(
            "/api/registrations",
            get(list_registrations).post(submit_registration),
        )
        .route("/api/registrations/live", get(live_feed))
        .route("/api/stats", get(stats))
        .route("/api/events", get(events))
        .route("/api/registrations/:id/status", post(update_status))
        .route("/api/registrations/:id", delete(delete_registration))
        .route("/api/registrations/:id/qr", get(registration_qr))
        .route("/api/active-event", post(set_active_event))
        .route("/api/scan", post(scan))
        .route("/api/focus", get(focus).delete(clear_focus))
        .route("/api/scans/recent", get(recent_scans))
        .route(
            "/api/attendance",
            post(mark_attendance).delete(remove_attendance),
        )
        .route("/api/attendance/:event", get(attendance_list))
        .route("/api/scanner", get(scanner_state))
        .route("/api/scanner/open", post(scanner_open))
        .route("/api/scanner/close", post(scanner_close))
        .route("/api/scanner/toggle", post(scanner_toggle))
        .route("/api/scanner/retry", post(scanner_retry))
        .route("/api/scanner/resume", post(scanner_resume))
        .route("/api/export/participants", get(export_participants))
        .route("/api/export/master", get(export_master))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            login::require_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    log::error!("Handler panicked: {}", detail);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Notice::error(CRASH_MESSAGE)),
    )
        .into_response()
}

/// Serve the console until the process is stopped
pub async fn run(config: ConsoleConfig) -> Result<()> {
    let backend: Arc<dyn RegistrationBackend> =
        Arc::new(JsonFileBackend::open(config.registrations_file())?);
    let addr = format!("{}:{}", config.bind_address, config.port);
    let (state, events) = AppState::new(config, backend)?;
    spawn_scan_consumer(state.clone(), events);
    spawn_session_sweeper(state.gate.clone());

    let listener = TcpListener::bind(&addr).await?;
    log::info!("Listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Camera access needs a secure context: HTTPS (possibly behind a proxy) or a
/// loopback host.
pub fn is_secure_context(headers: &HeaderMap, assume_secure: bool) -> bool {
    if assume_secure {
        return true;
    }
    let forwarded_https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
    if forwarded_https {
        return true;
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let hostname = if host.starts_with('[') {
        host.split(']').next().map(|h| &h[1..]).unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or_default()
    };
    matches!(hostname, "localhost" | "127.0.0.1" | "::1")
}

fn session_missing() -> ConsoleError {
    ConsoleError::Unauthorized("Session ended".to_string())
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn list_registrations(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<Registration>> {
    let snapshot = state.store.snapshot();
    let found = summary::search(&snapshot, query.q.as_deref().unwrap_or_default());
    Json(found.into_iter().cloned().collect())
}

async fn submit_registration(
    State(state): State<AppState>,
    Json(submission): Json<NewRegistration>,
) -> Result<(StatusCode, Json<Notice>)> {
    let clean = submission.sanitize();
    if clean.name.is_empty() {
        return Err(ConsoleError::Malformed("Name is required".to_string()));
    }
    if clean.transaction_id.is_empty() {
        return Err(ConsoleError::Malformed("Transaction ID is required".to_string()));
    }
    let has_events = !clean.events.is_empty()
        || clean
            .members
            .as_ref()
            .is_some_and(|ms| ms.iter().any(|m| !m.events.is_empty()));
    if !has_events {
        return Err(ConsoleError::Malformed("Select at least one event".to_string()));
    }

    let id = state.backend.create(clean)?;
    Ok((
        StatusCode::CREATED,
        Json(Notice::success("Registration submitted").with_data(serde_json::json!({ "id": id }))),
    ))
}

async fn live_feed(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.store.watch()).map(|snapshot| {
        Ok(match Event::default().event("registrations").json_data(&*snapshot) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Failed to encode live snapshot: {}", e);
                Event::default().comment("snapshot unavailable")
            }
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stats(State(state): State<AppState>) -> Json<DashboardStats> {
    Json(summary::stats(&state.store.snapshot()))
}

async fn events(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(summary::distinct_events(&state.store.snapshot()))
}

#[derive(Deserialize)]
struct StatusRequest {
    status: RegistrationStatus,
}

async fn update_status(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Notice>> {
    admin.require_mode(AdminMode::Dashboard)?;
    let report = notify::update_status(
        state.backend.as_ref(),
        &state.store,
        state.notifier.as_ref(),
        &id,
        request.status,
    )
    .await?;

    let updated = format!("Status updated to {}", request.status);
    let notice = match report {
        None => Notice::success(updated),
        Some(r) if r.all_sent() => Notice::success(format!("{}. {}", updated, r.message())),
        Some(r) => Notice::error(format!("{}. {}", updated, r.message())),
    };
    Ok(Json(notice.with_data(serde_json::json!({
        "status": request.status,
        "emails": report,
    }))))
}

async fn delete_registration(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    Path(id): Path<String>,
) -> Result<Json<Notice>> {
    admin.require_mode(AdminMode::Dashboard)?;
    state.backend.delete(&id).map_err(|e| {
        log::error!("Failed to delete {}: {}", id, e);
        e
    })?;
    Ok(Json(Notice::success("Deleted successfully")))
}

#[derive(Serialize)]
struct QrCard {
    name: String,
    payload: ScanPayload,
    url: String,
}

async fn registration_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<QrCard>>> {
    let reg = state
        .store
        .find(&id)
        .ok_or_else(|| ConsoleError::NotFound(id.clone()))?;
    let cards = ScanPayload::for_registration(&reg)
        .into_iter()
        .map(|payload| QrCard {
            name: payload.name.clone(),
            url: state.qr.url(DISPLAY_QR_SIZE, &payload.to_text(), Some(0)),
            payload,
        })
        .collect();
    Ok(Json(cards))
}

#[derive(Deserialize)]
struct ActiveEventRequest {
    event: Option<String>,
}

async fn set_active_event(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    Json(request): Json<ActiveEventRequest>,
) -> Result<Json<Notice>> {
    let event = request.event.filter(|e| !e.trim().is_empty());
    let message = match &event {
        Some(e) => format!("Taking attendance for {}", e),
        None => "No active event".to_string(),
    };
    state
        .gate
        .with_session(&admin.session_id, |s| s.active_event = event)
        .ok_or_else(session_missing)?;
    Ok(Json(Notice::info(message)))
}

#[derive(Deserialize)]
struct ScanRequest {
    raw: String,
}

async fn scan(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanReport>> {
    process_scan(&state, &admin.session_id, &request.raw)
        .map(Json)
        .ok_or_else(session_missing)
}

#[derive(Serialize)]
struct FocusView {
    focus: Option<ScanFocus>,
    registration: Option<Registration>,
    member: Option<TeamMember>,
    active_event: Option<String>,
    readiness: Option<Readiness>,
    /// Drives the "Mark Present" button
    can_mark: bool,
}

async fn focus(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<FocusView>> {
    let session = state
        .gate
        .session(&admin.session_id)
        .ok_or_else(session_missing)?;
    let registration = session
        .focus
        .as_ref()
        .and_then(|f| state.store.find(&f.registration_id));
    let member = match (&session.focus, &registration) {
        (Some(f), Some(reg)) => reg.roster().get(f.member_index).cloned(),
        _ => None,
    };
    let readiness = match (&session.focus, &registration, &session.active_event) {
        (Some(f), Some(reg), Some(event)) => Some(assess(reg, f.member_index, event)),
        _ => None,
    };

    Ok(Json(FocusView {
        focus: session.focus,
        registration,
        member,
        active_event: session.active_event,
        can_mark: readiness.is_some_and(|r| r.can_mark()),
        readiness,
    }))
}

async fn clear_focus(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<Notice>> {
    state
        .gate
        .with_session(&admin.session_id, |s| s.focus = None)
        .ok_or_else(session_missing)?;
    Ok(Json(Notice::info("Selection cleared")))
}

async fn recent_scans(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<Vec<ScanRecord>>> {
    state
        .gate
        .session(&admin.session_id)
        .map(|s| Json(s.scans.entries()))
        .ok_or_else(session_missing)
}

#[derive(Deserialize)]
struct AttendanceRequest {
    registration_id: String,
    member_index: usize,
    /// Defaults to the session's active event
    event: Option<String>,
}

impl AttendanceRequest {
    fn event(&self, state: &AppState, admin: &CurrentAdmin) -> Result<String> {
        self.event
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| {
                state
                    .gate
                    .session(&admin.session_id)
                    .and_then(|s| s.active_event)
            })
            .ok_or_else(|| ConsoleError::Malformed("No active event selected".to_string()))
    }
}

fn member_name(state: &AppState, id: &str, index: usize) -> String {
    state
        .store
        .find(id)
        .and_then(|r| r.roster().get(index).map(|m| m.name.clone()))
        .unwrap_or_default()
}

async fn mark_attendance(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    Json(request): Json<AttendanceRequest>,
) -> Result<Json<Notice>> {
    admin.require_mode(AdminMode::Attendance)?;
    let event = request.event(&state, &admin)?;
    let name = member_name(&state, &request.registration_id, request.member_index);

    let outcome = state
        .desk
        .mark_attendance(&request.registration_id, request.member_index, &event)?;
    let notice = match outcome {
        MutationOutcome::Applied => {
            state.gate.with_session(&admin.session_id, |s| {
                s.record(ScanRecord::new(&name, &event, true, "Present"));
                s.focus = None;
            });
            Notice::success(format!("Attendance marked: {}", name))
        }
        MutationOutcome::Unchanged => Notice::info("Already marked present"),
    };
    Ok(Json(notice.with_data(outcome)))
}

async fn remove_attendance(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    Json(request): Json<AttendanceRequest>,
) -> Result<Json<Notice>> {
    let event = request.event(&state, &admin)?;
    let name = member_name(&state, &request.registration_id, request.member_index);

    let outcome = state
        .desk
        .remove_attendance(&request.registration_id, request.member_index, &event)?;
    let notice = match outcome {
        MutationOutcome::Applied => Notice::success(format!("Attendance removed: {}", name)),
        MutationOutcome::Unchanged => Notice::info("No attendance to remove"),
    };
    Ok(Json(notice.with_data(outcome)))
}

#[derive(Serialize)]
struct AttendanceList {
    event: String,
    count: usize,
    present: Vec<PresentMember>,
}

async fn attendance_list(
    State(state): State<AppState>,
    Path(event): Path<String>,
) -> Json<AttendanceList> {
    let present = present_members(&state.store.snapshot(), &event);
    Json(AttendanceList {
        event,
        count: present.len(),
        present,
    })
}

#[derive(Serialize)]
struct ScannerView {
    scanner: ScannerState,
    can_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<Notice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_scan: Option<ScanReport>,
}

impl ScannerView {
    fn new(state: ScannerState, last_scan: Option<ScanReport>) -> Self {
        let notice = match &state {
            ScannerState::InsecureContext => Some(Notice::error(INSECURE_CONTEXT_MESSAGE)),
            ScannerState::Failed { message, .. } => Some(Notice::error(message.clone())),
            _ => None,
        };
        ScannerView {
            can_retry: state.can_retry(),
            scanner: state,
            notice,
            last_scan,
        }
    }
}

async fn scanner_state(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Json<ScannerView> {
    let current = state.scanner.lock().await.state();
    let last_scan = if state.scanner_owner().as_deref() == Some(admin.session_id.as_str()) {
        lock(&state.last_scan).clone()
    } else {
        None
    };
    Json(ScannerView::new(current, last_scan))
}

async fn scanner_open(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
    headers: HeaderMap,
) -> Json<ScannerView> {
    let secure = is_secure_context(&headers, state.config.assume_secure);
    *lock(&state.scanner_owner) = Some(admin.session_id.clone());
    *lock(&state.last_scan) = None;
    let opened = state.scanner.lock().await.open(secure).await;
    Json(ScannerView::new(opened, None))
}

async fn scanner_close(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<ScannerView>> {
    state.check_scanner_owner(&admin.session_id)?;
    let closed = state.scanner.lock().await.close().await;
    *lock(&state.scanner_owner) = None;
    Ok(Json(ScannerView::new(closed, None)))
}

async fn scanner_toggle(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<ScannerView>> {
    state.check_scanner_owner(&admin.session_id)?;
    let toggled = state.scanner.lock().await.toggle_facing().await;
    Ok(Json(ScannerView::new(toggled, None)))
}

async fn scanner_retry(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<ScannerView>> {
    state.check_scanner_owner(&admin.session_id)?;
    let retried = state.scanner.lock().await.retry().await;
    Ok(Json(ScannerView::new(retried, None)))
}

async fn scanner_resume(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentAdmin>,
) -> Result<Json<ScannerView>> {
    state.check_scanner_owner(&admin.session_id)?;
    let resumed = state.scanner.lock().await.resume();
    Ok(Json(ScannerView::new(resumed, None)))
}

async fn export(state: &AppState, plan: ReportPlan) -> Result<Response> {
    let bytes = downloader::render(&plan, &state.qr, state.images.as_ref()).await?;
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_MIME.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", plan.file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn export_participants(State(state): State<AppState>) -> Result<Response> {
    let plan = downloader::participants_report(&state.store.snapshot());
    export(&state, plan).await
}

#[derive(Deserialize)]
struct MasterQuery {
    #[serde(default)]
    attendance: bool,
}

async fn export_master(
    State(state): State<AppState>,
    Query(query): Query<MasterQuery>,
) -> Result<Response> {
    let plan = downloader::master_report(&state.store.snapshot(), query.attendance);
    export(&state, plan).await
}
