/*!
# Registration Desk

Administrative console for an event-registration system, served as an HTTP/JSON API.

## Overview

Staff log in to review registrations, verify payments, scan participant QR tickets,
mark per-event attendance and export spreadsheet reports. Registrations live in a
document collection that pushes its full contents to subscribers on every change.

## Architecture

### Data Layer
- **registration**: Registration, team member and attendance data model
- **backend**: The document collection and its live feed (JSON file or in-memory)
- **store**: Client-side cache with a single writer, the feed task
- **saving**: Atomic JSON persistence

### Scan & Attendance
- **payload**: QR payload codec and the remote QR image endpoint
- **scanner**: Scan device trait and the scanner session state machine
- **device**: Line-oriented scan device (HID/serial scanners in text mode)
- **resolver**: Classifies decoded scans against the cache
- **attendance**: Idempotent mark/remove of per-event attendance
- **notify**: Status change followed by throttled verification emails
- **summary**: Dashboard statistics and search

### Console (feature `web`)
- **login**: Admin accounts, sessions and the authentication middleware
- **mailer**: SMTP delivery of verification emails
- **downloader**: Spreadsheet reports with embedded QR images
- **app**: Routing, handlers and middleware

## Design Highlights

- One live-feed subscription at a time, attached on the first login and torn
  down on the last logout
- Scanner frames are delivered through a single-slot channel and decoding
  pauses after each read
- Attendance writes replace the whole member array; the last writer wins

## REST API Endpoints

- `/api/login`, `/api/logout`, `/api/session` - Session gate
- `/api/registrations` - List (with `?q=`) and public submission
- `/api/registrations/live` - Server-sent live feed
- `/api/registrations/{id}/status` - Status change and verification emails
- `/api/scan`, `/api/focus`, `/api/attendance` - Scan and attendance flow
- `/api/scanner/{open,close,toggle,retry,resume}` - Scanner dialog
- `/api/export/participants`, `/api/export/master` - Spreadsheet reports
*/

pub mod attendance;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod notify;
pub mod payload;
pub mod registration;
pub mod resolver;
pub mod saving;
pub mod scanner;
pub mod store;
pub mod summary;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod downloader;
#[cfg(feature = "web")]
pub mod login;
#[cfg(feature = "web")]
pub mod mailer;

pub use config::ConsoleConfig;
pub use error::{ConsoleError, Result};
pub use registration::{Registration, RegistrationStatus, TeamMember};
