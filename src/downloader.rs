use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Format, FormatAlign, Image, Workbook};
use std::collections::HashSet;
use std::future::Future;
use std::io::Cursor;

use crate::error::{ConsoleError, Result};
use crate::payload::{EXPORT_QR_SIZE, QrEndpoint, ScanPayload};
use crate::registration::{Registration, TeamMember};
use crate::resolver::local_time;
use crate::summary::distinct_events;

pub const PARTICIPANTS_FILE: &str = "all_participants.xlsx";
pub const MASTER_FILE: &str = "master_sheets.xlsx";
pub const ATTENDANCE_FILE: &str = "attendance_sheets.xlsx";

const ROW_HEIGHT: f64 = 80.0;
const QR_PIXELS: u32 = 100;
const MAX_SHEET_NAME: usize = 31;

/// One data row: text for every column after the QR column, plus the
/// payload whose image goes into column A.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub cells: Vec<String>,
    pub payload: ScanPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSheet {
    pub name: String,
    /// (header, width) for every column, QR column included
    pub columns: Vec<(&'static str, f64)>,
    pub rows: Vec<ReportRow>,
}

/// Everything needed to write a workbook, minus the images.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPlan {
    pub file_name: &'static str,
    pub sheets: Vec<ReportSheet>,
}

impl ReportPlan {
    pub fn row_count(&self) -> usize {
        self.sheets.iter().map(|s| s.rows.len()).sum()
    }
}

/// One row per member of every registration, on a single sheet.
pub fn participants_report(registrations: &[Registration]) -> ReportPlan {
    let rows = registrations
        .iter()
        .flat_map(|reg| {
            reg.roster()
                .into_iter()
                .enumerate()
                .map(move |(index, m)| ReportRow {
                    cells: vec![
                        m.name.clone(),
                        m.department.clone(),
                        if m.year.is_empty() {
                            "N/A".to_string()
                        } else {
                            m.year.clone()
                        },
                        m.college.clone(),
                        m.phone.clone(),
                        m.email.clone(),
                        m.events.join("; "),
                        reg.status.to_string(),
                    ],
                    payload: payload(reg, index, &m),
                })
        })
        .collect();

    ReportPlan {
        file_name: PARTICIPANTS_FILE,
        sheets: vec![ReportSheet {
            name: "All Participants".to_string(),
            columns: vec![
                ("QR Code", 15.0),
                ("Name", 20.0),
                ("Dept", 15.0),
                ("Year", 10.0),
                ("College", 25.0),
                ("Phone", 15.0),
                ("Email", 30.0),
                ("Events", 40.0),
                ("Status", 15.0),
            ],
            rows,
        }],
    }
}

/// One sheet per event, one row per member registered for it
///
/// The Team column numbers the registrations that have at least one member
/// in the event, in feed order.
///
/// # Arguments
/// * `registrations` - Current cache contents
/// * `include_attendance` - Append an Attendance column (Present with time, or Absent)
pub fn master_report(registrations: &[Registration], include_attendance: bool) -> ReportPlan {
    let mut taken = HashSet::new();
    let mut sheets = Vec::new();

    for event in distinct_events(registrations) {
        let mut columns = vec![
            ("QR Code", 15.0),
            ("Team", 10.0),
            ("Name", 20.0),
            ("Dept", 15.0),
            ("College", 25.0),
            ("Phone", 15.0),
            ("Email", 30.0),
        ];
        if include_attendance {
            columns.push(("Attendance", 20.0));
        }

        let mut rows = Vec::new();
        let mut team = 0;
        for reg in registrations {
            let participating: Vec<(usize, TeamMember)> = reg
                .roster()
                .into_iter()
                .enumerate()
                .filter(|(_, m)| m.is_registered_for(&event))
                .collect();
            if participating.is_empty() {
                continue;
            }
            team += 1;

            for (index, m) in participating {
                let mut cells = vec![
                    team.to_string(),
                    m.name.clone(),
                    m.department.clone(),
                    m.college.clone(),
                    m.phone.clone(),
                    m.email.clone(),
                ];
                if include_attendance {
                    cells.push(attendance_label(&m, &event));
                }
                rows.push(ReportRow {
                    cells,
                    payload: payload(reg, index, &m),
                });
            }
        }

        sheets.push(ReportSheet {
            name: sheet_name(&event, &mut taken),
            columns,
            rows,
        });
    }

    ReportPlan {
        file_name: if include_attendance {
            ATTENDANCE_FILE
        } else {
            MASTER_FILE
        },
        sheets,
    }
}

fn payload(reg: &Registration, index: usize, m: &TeamMember) -> ScanPayload {
    ScanPayload {
        id: reg.id.clone(),
        index,
        name: m.name.clone(),
        events: m.events.clone(),
    }
}

fn attendance_label(m: &TeamMember, event: &str) -> String {
    match m.attendance_for(event) {
        Some(entry) if entry.attended => match DateTime::parse_from_rfc3339(&entry.timestamp) {
            Ok(at) => format!("Present ({})", local_time(&at.with_timezone(&Utc))),
            Err(_) => "Present".to_string(),
        },
        _ => "Absent".to_string(),
    }
}

/// Worksheet name for `event`: at most 31 characters, none of `\ / ? * [ ] :`,
/// and unique (ignoring case) within `taken`.
pub fn sheet_name(event: &str, taken: &mut HashSet<String>) -> String {
    let cleaned: String = event
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '?' | '*' | '[' | ']' | ':'))
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'').trim();
    let base: String = if cleaned.is_empty() {
        "Event".to_string()
    } else {
        cleaned.chars().take(MAX_SHEET_NAME).collect()
    };

    let mut name = base.clone();
    let mut n = 2;
    while taken.contains(&name.to_lowercase()) {
        let suffix = format!(" ({})", n);
        let keep = MAX_SHEET_NAME - suffix.chars().count();
        name = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
        n += 1;
    }
    taken.insert(name.to_lowercase());
    name
}

/// Source of QR raster images.
pub trait QrImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Fetches QR images from the remote generator over HTTP.
pub struct HttpQrSource {
    client: reqwest::Client,
}

impl HttpQrSource {
    pub fn new(client: reqwest::Client) -> Self {
        HttpQrSource { client }
    }
}

impl QrImageSource for HttpQrSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Decode any supported raster and re-encode it as PNG.
fn to_png(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes).map_err(|e| ConsoleError::Export(e.to_string()))?;
    let mut png = Cursor::new(Vec::new());
    decoded
        .write_to(&mut png, image::ImageOutputFormat::Png)
        .map_err(|e| ConsoleError::Export(e.to_string()))?;
    Ok(png.into_inner())
}

/// Fetch the QR image of every row, in plan order
///
/// A row whose image cannot be fetched or decoded gets `None`; the export
/// carries on without it.
pub async fn fetch_images<S: QrImageSource>(
    plan: &ReportPlan,
    qr: &QrEndpoint,
    source: &S,
) -> Vec<Vec<Option<Vec<u8>>>> {
    let mut images = Vec::with_capacity(plan.sheets.len());
    for sheet in &plan.sheets {
        let mut sheet_images = Vec::with_capacity(sheet.rows.len());
        for row in &sheet.rows {
            let url = qr.url(EXPORT_QR_SIZE, &row.payload.to_text(), Some(0));
            let image = match source.fetch(&url).await.and_then(|bytes| to_png(&bytes)) {
                Ok(png) => Some(png),
                Err(e) => {
                    log::warn!(
                        "QR embedding failed for {}#{}: {}",
                        row.payload.id,
                        row.payload.index,
                        e
                    );
                    None
                }
            };
            sheet_images.push(image);
        }
        images.push(sheet_images);
    }
    images
}

/// Write the workbook for `plan` with the already fetched `images`.
pub fn write_workbook(plan: &ReportPlan, images: &[Vec<Option<Vec<u8>>>]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header = Format::new()
        .set_bold()
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter);
    let body = Format::new().set_align(FormatAlign::VerticalCenter);

    for (s, sheet) in plan.sheets.iter().enumerate() {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&sheet.name)?;

        for (col, (title, width)) in sheet.columns.iter().enumerate() {
            let col = col as u16;
            worksheet.set_column_width(col, *width)?;
            worksheet.write_string_with_format(0, col, *title, &header)?;
        }

        for (r, row) in sheet.rows.iter().enumerate() {
            let line = (r + 1) as u32;
            worksheet.set_row_height(line, ROW_HEIGHT)?;
            for (c, text) in row.cells.iter().enumerate() {
                worksheet.write_string_with_format(line, (c + 1) as u16, text, &body)?;
            }

            let png = images.get(s).and_then(|i| i.get(r)).and_then(|i| i.as_ref());
            if let Some(png) = png {
                match Image::new_from_buffer(png) {
                    Ok(image) => {
                        let image = image.set_scale_to_size(QR_PIXELS, QR_PIXELS, true);
                        worksheet.insert_image_with_offset(line, 0, &image, 5, 3)?;
                    }
                    Err(e) => log::warn!("Skipping unreadable QR image: {}", e),
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Fetch images and write the workbook for `plan`.
pub async fn render<S: QrImageSource>(plan: &ReportPlan, qr: &QrEndpoint, source: &S) -> Result<Vec<u8>> {
    let images = fetch_images(plan, qr, source).await;
    log::info!(
        "Writing {} ({} rows, {} sheets)",
        plan.file_name,
        plan.row_count(),
        plan.sheets.len()
    );
    write_workbook(plan, &images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn team() -> Vec<Registration> {
        serde_json::from_str(
            r#"[
            {"id":"R1","name":"Lead","status":"Verified","serverTimestamp":"2026-03-01T10:00:00Z",
             "members":[
               {"name":"A","department":"CSE","year":"2","events":["Quiz"],
                "attendance":{"Quiz":{"attended":true,"timestamp":"2026-03-13T09:10:00.000Z"}}},
               {"name":"B","events":["Quiz","Chess"]},
               {"name":"C","events":["Chess"]}]},
            {"id":"R2","name":"Solo","email":"solo@mail.test","status":"Pending Verification",
             "serverTimestamp":"2026-03-01T09:00:00Z","events":["Quiz"]}
        ]"#,
        )
        .unwrap()
    }

    /// Image source handing out a valid PNG, except for one payload index.
    struct Pixels {
        fail_index: Option<usize>,
        urls: Mutex<Vec<String>>,
    }

    impl QrImageSource for Pixels {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.urls.lock().unwrap().push(url.to_string());
            if let Some(i) = self.fail_index {
                if url.contains(&format!("%22index%22%3A{}", i)) {
                    return Err(ConsoleError::Export("qr service down".into()));
                }
            }
            let img = image::RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
            let mut png = Cursor::new(Vec::new());
            image::DynamicImage::ImageRgb8(img)
                .write_to(&mut png, image::ImageOutputFormat::Png)
                .unwrap();
            Ok(png.into_inner())
        }
    }

    #[test]
    fn three_members_three_rows_distinct_payloads() {
        let regs = team();
        let plan = participants_report(&regs[..1]);
        let rows = &plan.sheets[0].rows;
        assert_eq!(rows.len(), 3);

        let keys: HashSet<(String, usize)> = rows
            .iter()
            .map(|r| (r.payload.id.clone(), r.payload.index))
            .collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(rows[0].cells[2], "2");
        assert_eq!(rows[1].cells[2], "N/A");
        assert_eq!(rows[1].cells[6], "Quiz; Chess");
        assert_eq!(rows[0].cells[7], "Verified");
    }

    #[test]
    fn lead_stands_in_without_member_list() {
        let plan = participants_report(&team());
        assert_eq!(plan.row_count(), 4);
        let solo = &plan.sheets[0].rows[3];
        assert_eq!(solo.cells[0], "Solo");
        assert_eq!(solo.payload.index, 0);
    }

    #[test]
    fn master_sheets_group_by_event() {
        let plan = master_report(&team(), true);
        assert_eq!(plan.file_name, ATTENDANCE_FILE);
        let names: Vec<&str> = plan.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Chess", "Quiz"]);

        let chess = &plan.sheets[0];
        assert_eq!(chess.rows.len(), 2);
        assert_eq!(chess.rows[0].payload.index, 1);
        assert_eq!(chess.rows[1].payload.index, 2);
        assert_eq!(chess.rows[1].cells[0], "1");

        let quiz = &plan.sheets[1];
        assert_eq!(quiz.columns.last().unwrap().0, "Attendance");
        assert_eq!(quiz.rows.len(), 3);
        assert!(quiz.rows[0].cells[6].starts_with("Present ("));
        assert_eq!(quiz.rows[1].cells[6], "Absent");
        assert_eq!(quiz.rows[2].cells[0], "2");

        let plain = master_report(&team(), false);
        assert_eq!(plain.file_name, MASTER_FILE);
        assert_eq!(plain.sheets[1].columns.len(), 7);
    }

    #[test]
    fn sheet_names_are_cleaned_and_unique() {
        let mut taken = HashSet::new();
        assert_eq!(sheet_name("Code: [Round 1]?", &mut taken), "Code Round 1");
        let long = "A very long event name that exceeds the limit";
        let first = sheet_name(long, &mut taken);
        assert_eq!(first.chars().count(), 31);
        let second = sheet_name(&long.to_uppercase(), &mut taken);
        assert_ne!(first.to_lowercase(), second.to_lowercase());
        assert!(second.ends_with(" (2)"));
        assert!(second.chars().count() <= 31);
        assert_eq!(sheet_name("///", &mut taken), "Event");
    }

    #[tokio::test]
    async fn failed_image_still_writes_workbook() {
        let plan = participants_report(&team()[..1]);
        let source = Pixels {
            fail_index: Some(1),
            urls: Mutex::new(Vec::new()),
        };
        let qr = QrEndpoint::new("https://qr.test/");

        let images = fetch_images(&plan, &qr, &source).await;
        assert_eq!(images[0].iter().filter(|i| i.is_some()).count(), 2);
        assert!(images[0][1].is_none());

        let urls = source.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 3);
        assert!(urls.iter().all(|u| u.contains("size=150x150") && u.ends_with("&margin=0")));

        let bytes = write_workbook(&plan, &images).unwrap();
        assert!(bytes.starts_with(b"PK"));

        let bytes = render(&master_report(&team(), true), &qr, &source).await.unwrap();
        assert!(bytes.starts_with(b"PK"));
    }
}
