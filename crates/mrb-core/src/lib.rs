//! Core task model, date handling, field reconciliation and report windowing.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "mrb-core";

/// Bucket sentinel for tasks without a usable calendar date.
pub const NO_DATE: &str = "No Date";
pub const DEFAULT_STATUS: &str = "UNKNOWN";
pub const DEFAULT_TITLE: &str = "Untitled";
pub const ALL_DAY: &str = "All Day";

/// Numbers above this are epoch milliseconds; smaller ones are codes.
pub const MIN_EPOCH_MS: i64 = 1_000_000_000_000;

/// Upstream record as delivered: an ordered, open-ended key/value mapping.
pub type RawRecord = Map<String, JsonValue>;

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse a date bucket or free-form date string into a calendar date.
///
/// `YYYY-MM-DD` is assembled from its components so the host timezone can never
/// move it to a neighbouring day. Other shapes are parsed as local wall-clock
/// values and only their calendar day is kept.
pub fn parse_local_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() || s == NO_DATE {
        return None;
    }
    parse_iso_day(s).or_else(|| parse_generic_date(s))
}

fn parse_iso_day(s: &str) -> Option<NaiveDate> {
    let bytes = s.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return None;
    }
    let year = s[0..4].parse::<i32>().ok()?;
    let month = s[5..7].parse::<u32>().ok()?;
    let day = s[8..10].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_generic_date(s: &str) -> Option<NaiveDate> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Local).date_naive());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in ["%m/%d/%Y", "%b %d, %Y", "%B %d, %Y", "%A, %b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }
    None
}

/// `Weekday, Mon DD, YYYY`; the sentinel and unparseable input pass through.
pub fn format_display_date(s: &str) -> String {
    match parse_local_date(s) {
        Some(date) => date.format("%A, %b %d, %Y").to_string(),
        None => s.to_string(),
    }
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%b %Y").to_string()
}

pub fn format_short_date(date: NaiveDate, include_year: bool) -> String {
    if include_year {
        date.format("%b %-d, %Y").to_string()
    } else {
        date.format("%b %-d").to_string()
    }
}

/// Calendar date of an epoch-millisecond instant, in `offset` or the host zone.
pub fn epoch_ms_to_date(ms: i64, offset: Option<FixedOffset>) -> Option<NaiveDate> {
    let instant = DateTime::<Utc>::from_timestamp_millis(ms)?;
    Some(match offset {
        Some(offset) => instant.with_timezone(&offset).date_naive(),
        None => instant.with_timezone(&Local).date_naive(),
    })
}

/// The value as epoch milliseconds, if it is a number above `threshold`.
pub fn plausible_epoch_ms(value: &JsonValue, threshold: i64) -> Option<i64> {
    let JsonValue::Number(n) = value else {
        return None;
    };
    let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
    (ms > threshold).then_some(ms)
}

/// Human-readable form of a cached ISO-8601 timestamp.
pub fn format_last_known_good(iso: &str) -> String {
    match DateTime::parse_from_rfc3339(iso) {
        Ok(ts) => ts
            .with_timezone(&Local)
            .format("%a, %b %-d, %Y at %-I:%M %p")
            .to_string(),
        Err(_) => iso.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BucketKey<'a> {
    Dated(NaiveDate),
    Undated(&'a str),
    NoDate,
}

fn bucket_key(bucket: &str) -> BucketKey<'_> {
    let trimmed = bucket.trim();
    if trimmed.is_empty() || trimmed == NO_DATE {
        return BucketKey::NoDate;
    }
    match parse_local_date(trimmed) {
        Some(date) => BucketKey::Dated(date),
        None => BucketKey::Undated(trimmed),
    }
}

/// Chronological order for date buckets with `"No Date"` always last.
pub fn compare_date_buckets(a: &str, b: &str) -> Ordering {
    bucket_key(a).cmp(&bucket_key(b))
}

// ---------------------------------------------------------------------------
// Task + field reconciliation
// ---------------------------------------------------------------------------

/// Canonical, renderable report line item. Unrecognized raw keys ride along in `raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub date: String,
    #[serde(default)]
    pub time: String,
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_walk_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hhg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vacate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kti: Option<String>,
    #[serde(rename = "openWOs", default, skip_serializing_if = "Option::is_none")]
    pub open_wos: Option<String>,
    #[serde(flatten)]
    pub raw: RawRecord,
}

impl Task {
    /// Milestones that carry a value, as `(label, value)` in display order.
    pub fn milestones(&self) -> Vec<(&'static str, &str)> {
        [
            ("CP Walk", &self.cp_walk_date),
            ("EVS", &self.evs),
            ("Key Release", &self.key_release),
            ("HHG", &self.hhg),
            ("Move In", &self.move_in),
            ("NTV", &self.ntv),
            ("Vacate", &self.vacate),
            ("KTI", &self.kti),
            ("Open WOs", &self.open_wos),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| (label, v)))
        .collect()
    }

    pub fn status_category(&self) -> StatusCategory {
        StatusCategory::classify(&self.status)
    }
}

/// One canonical field and the raw keys it may be sourced from, highest priority first.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub canonical: &'static str,
    pub candidates: &'static [&'static str],
}

/// Candidate keys across the legacy tabular export and the direct/enriched API shapes.
pub const FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        canonical: "date",
        candidates: &[
            "date",
            "dueDateFormatted",
            "Due Date",
            "Scheduled Date",
            "Date",
            "dueDate",
            "scheduledDate",
        ],
    },
    FieldRule {
        canonical: "time",
        candidates: &["time", "Time", "Scheduled Time", "dueTime"],
    },
    FieldRule {
        canonical: "status",
        candidates: &[
            "statusName",
            "Status - StatusId → Name",
            "requestStatus",
            "status",
            "Status",
        ],
    },
    FieldRule {
        canonical: "title",
        candidates: &["title", "Title", "name", "Name", "subject", "Subject"],
    },
    FieldRule {
        canonical: "description",
        candidates: &["description", "Description", "Request Description"],
    },
    FieldRule {
        canonical: "details",
        candidates: &[
            "details",
            "Details",
            "workflowName",
            "Workflow - Name",
            "location",
            "Location - Name",
        ],
    },
    FieldRule {
        canonical: "serviceRequestId",
        candidates: &[
            "serviceRequestId",
            "Service Request Id",
            "Service Request ID",
            "id",
            "Id",
        ],
    },
    FieldRule {
        canonical: "cpWalkDate",
        candidates: &["cpWalkDate", "CP Walk Date", "cp_walk_date"],
    },
    FieldRule {
        canonical: "evs",
        candidates: &["evs", "EVS"],
    },
    FieldRule {
        canonical: "keyRelease",
        candidates: &["keyRelease", "Key Release", "key_release"],
    },
    FieldRule {
        canonical: "hhg",
        candidates: &["hhg", "HHG"],
    },
    FieldRule {
        canonical: "moveIn",
        candidates: &["moveIn", "Move In", "Move-In", "move_in"],
    },
    FieldRule {
        canonical: "ntv",
        candidates: &["ntv", "NTV"],
    },
    FieldRule {
        canonical: "vacate",
        candidates: &["vacate", "Vacate"],
    },
    FieldRule {
        canonical: "kti",
        candidates: &["kti", "KTI"],
    },
    FieldRule {
        canonical: "openWOs",
        candidates: &["openWOs", "Open WOs", "Open Work Orders", "openWorkOrders"],
    },
];

fn is_canonical_key(key: &str) -> bool {
    FIELD_RULES.iter().any(|rule| rule.canonical == key)
}

fn has_scalar_text(value: &JsonValue) -> bool {
    scalar_text(value).is_some()
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First non-empty scalar among the canonical field's candidate keys.
pub fn resolve_value<'a>(record: &'a RawRecord, canonical: &str) -> Option<&'a JsonValue> {
    let rule = FIELD_RULES.iter().find(|rule| rule.canonical == canonical)?;
    rule.candidates
        .iter()
        .filter_map(|key| record.get(*key))
        .find(|value| has_scalar_text(value))
}

pub fn resolve_field(record: &RawRecord, canonical: &str) -> Option<String> {
    resolve_value(record, canonical).and_then(scalar_text)
}

fn date_bucket(value: Option<&JsonValue>) -> String {
    let date = match value {
        Some(number @ JsonValue::Number(_)) => plausible_epoch_ms(number, MIN_EPOCH_MS)
            .and_then(|ms| epoch_ms_to_date(ms, None)),
        Some(JsonValue::String(s)) => parse_local_date(s),
        _ => None,
    };
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| NO_DATE.to_string())
}

fn time_label(value: Option<String>) -> String {
    match value {
        Some(v) if v.eq_ignore_ascii_case(ALL_DAY) => String::new(),
        Some(v) => v,
        None => String::new(),
    }
}

/// Map one upstream record of any known shape onto the canonical [`Task`].
///
/// Never fails: absent fields fall back to `"No Date"`, `"UNKNOWN"`, `"Untitled"`
/// or the empty string. Raw keys that are not canonical names are copied
/// through unchanged.
pub fn reconcile(record: &RawRecord) -> Task {
    let field = |canonical: &str| resolve_field(record, canonical);
    let raw = record
        .iter()
        .filter(|(key, _)| !is_canonical_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<RawRecord>();

    Task {
        date: date_bucket(resolve_value(record, "date")),
        time: time_label(field("time")),
        status: field("status").unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        title: field("title").unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        description: field("description").unwrap_or_default(),
        details: field("details").unwrap_or_default(),
        service_request_id: field("serviceRequestId"),
        cp_walk_date: field("cpWalkDate"),
        evs: field("evs"),
        key_release: field("keyRelease"),
        hhg: field("hhg"),
        move_in: field("moveIn"),
        ntv: field("ntv"),
        vacate: field("vacate"),
        kti: field("kti"),
        open_wos: field("openWOs"),
        raw,
    }
}

pub fn reconcile_all(records: &[RawRecord]) -> Vec<Task> {
    records.iter().map(reconcile).collect()
}

// ---------------------------------------------------------------------------
// Status classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCategory {
    Complete,
    InProgress,
    Pending,
    Overdue,
    Cancelled,
    Other,
}

const STATUS_KEYWORDS: &[(StatusCategory, &[&str])] = &[
    (StatusCategory::Complete, &["complete", "done", "closed"]),
    (StatusCategory::InProgress, &["progress", "active"]),
    (StatusCategory::Pending, &["pending", "waiting"]),
    (StatusCategory::Overdue, &["overdue", "late"]),
    (StatusCategory::Cancelled, &["cancel", "stopped"]),
];

impl StatusCategory {
    pub fn classify(status: &str) -> Self {
        let lower = status.to_lowercase();
        STATUS_KEYWORDS
            .iter()
            .find(|(_, needles)| needles.iter().any(|needle| lower.contains(needle)))
            .map(|(category, _)| *category)
            .unwrap_or(StatusCategory::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCategory::Complete => "complete",
            StatusCategory::InProgress => "in-progress",
            StatusCategory::Pending => "pending",
            StatusCategory::Overdue => "overdue",
            StatusCategory::Cancelled => "cancelled",
            StatusCategory::Other => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// Report model
// ---------------------------------------------------------------------------

/// Year-qualified month; the grouping key behind every `Mon YYYY` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn label(&self) -> String {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .map(month_key)
            .unwrap_or_default()
    }
}

/// Inclusive month-index selection into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateGroup {
    pub date: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthGroup {
    pub label: String,
    #[serde(skip)]
    pub key: Option<YearMonth>,
    pub dates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleGroup {
    pub date: String,
    pub display_date: String,
    pub tasks: Vec<Task>,
}

/// Everything the presentation layer needs for one selected month range.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowView {
    pub range: Option<DateRange>,
    pub range_label: String,
    pub months: Vec<String>,
    pub visible_count: usize,
    pub total_count: usize,
    pub groups: Vec<VisibleGroup>,
}

/// Partition tasks by `date`, first-seen bucket order, input order within a bucket.
pub fn group_by_date(tasks: impl IntoIterator<Item = Task>) -> Vec<DateGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<DateGroup> = Vec::new();
    for mut task in tasks {
        let bucket = task.date.trim();
        let bucket = if bucket.is_empty() { NO_DATE } else { bucket }.to_string();
        task.date = bucket.clone();
        match index.get(&bucket) {
            Some(&i) => groups[i].tasks.push(task),
            None => {
                index.insert(bucket.clone(), groups.len());
                groups.push(DateGroup {
                    date: bucket,
                    tasks: vec![task],
                });
            }
        }
    }
    groups
}

/// Grouped, sorted snapshot of one fetch cycle's tasks.
#[derive(Debug, Clone, Default)]
pub struct ReportModel {
    groups: Vec<DateGroup>,
    group_month: Vec<Option<usize>>,
    timeline: Vec<MonthGroup>,
}

impl ReportModel {
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut groups = group_by_date(tasks);
        groups.sort_by(|a, b| compare_date_buckets(&a.date, &b.date));

        let mut timeline: Vec<MonthGroup> = Vec::new();
        let mut group_month = Vec::with_capacity(groups.len());
        for group in &groups {
            let BucketKey::Dated(date) = bucket_key(&group.date) else {
                group_month.push(None);
                continue;
            };
            let key = YearMonth::of(date);
            match timeline.last_mut() {
                Some(last) if last.key == Some(key) => last.dates.push(group.date.clone()),
                _ => timeline.push(MonthGroup {
                    label: key.label(),
                    key: Some(key),
                    dates: vec![group.date.clone()],
                }),
            }
            group_month.push(Some(timeline.len() - 1));
        }

        Self {
            groups,
            group_month,
            timeline,
        }
    }

    pub fn groups(&self) -> &[DateGroup] {
        &self.groups
    }

    pub fn total_tasks(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }

    pub fn sorted_date_buckets(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.date.as_str()).collect()
    }

    /// Distinct months spanned by dated buckets, oldest first.
    pub fn month_timeline(&self) -> &[MonthGroup] {
        &self.timeline
    }

    /// Timeline plus a trailing `"No Date"` group holding every undated bucket.
    pub fn month_groups(&self) -> Vec<MonthGroup> {
        let mut out = self.timeline.clone();
        let undated = self
            .groups
            .iter()
            .zip(&self.group_month)
            .filter(|(_, month)| month.is_none())
            .map(|(g, _)| g.date.clone())
            .collect::<Vec<_>>();
        if !undated.is_empty() {
            out.push(MonthGroup {
                label: NO_DATE.to_string(),
                key: None,
                dates: undated,
            });
        }
        out
    }

    fn last_index(&self) -> Option<usize> {
        self.timeline.len().checked_sub(1)
    }

    /// Current month (or the next month with data) through the end; the last
    /// month alone when everything is in the past.
    pub fn default_window(&self, today: NaiveDate) -> Option<DateRange> {
        let last = self.last_index()?;
        let current = YearMonth::of(today);
        let start = self
            .timeline
            .iter()
            .position(|m| m.key.is_some_and(|k| k >= current))
            .unwrap_or(last);
        Some(DateRange { start, end: last })
    }

    pub fn set_window(&self, range: DateRange) -> Option<DateRange> {
        let last = self.last_index()?;
        let end = range.end.min(last);
        let start = range.start.min(last).min(end);
        Some(DateRange { start, end })
    }

    pub fn reset_window(&self) -> Option<DateRange> {
        self.last_index().map(|end| DateRange { start: 0, end })
    }

    fn group_visible(&self, month: Option<usize>, range: Option<DateRange>) -> bool {
        match (month, range) {
            (None, _) => true,
            (Some(idx), Some(r)) => r.start <= idx && idx <= r.end,
            (Some(_), None) => false,
        }
    }

    /// Tasks in the selected months plus every undated task, in bucket order.
    pub fn visible_tasks(&self, range: Option<DateRange>) -> Vec<&Task> {
        self.groups
            .iter()
            .zip(&self.group_month)
            .filter(|(_, month)| self.group_visible(**month, range))
            .flat_map(|(g, _)| g.tasks.iter())
            .collect()
    }

    pub fn range_label(&self, range: Option<DateRange>) -> String {
        let Some(range) = range else {
            return "No dated tasks".to_string();
        };
        let label = |i: usize| {
            self.timeline
                .get(i)
                .map(|m| m.label.clone())
                .unwrap_or_default()
        };
        if range.start == range.end {
            label(range.start)
        } else {
            format!("{} - {}", label(range.start), label(range.end))
        }
    }

    pub fn window_view(&self, range: Option<DateRange>) -> WindowView {
        let groups = self
            .groups
            .iter()
            .zip(&self.group_month)
            .filter(|(_, month)| self.group_visible(**month, range))
            .map(|(g, _)| VisibleGroup {
                date: g.date.clone(),
                display_date: format_display_date(&g.date),
                tasks: g.tasks.clone(),
            })
            .collect::<Vec<_>>();
        WindowView {
            range,
            range_label: self.range_label(range),
            months: self.timeline.iter().map(|m| m.label.clone()).collect(),
            visible_count: groups.iter().map(|g| g.tasks.len()).sum(),
            total_count: self.total_tasks(),
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> RawRecord {
        value.as_object().cloned().expect("object literal")
    }

    fn task_on(date: &str, title: &str) -> Task {
        reconcile(&record(json!({ "date": date, "title": title })))
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn iso_day_is_built_from_components() {
        let date = parse_local_date("2025-02-23").unwrap();
        assert_eq!(date.year(), 2025);
        assert_eq!(date.month0(), 1);
        assert_eq!(date.day(), 23);
    }

    #[test]
    fn sentinel_and_blank_are_not_dates() {
        assert_eq!(parse_local_date(NO_DATE), None);
        assert_eq!(parse_local_date(""), None);
        assert_eq!(parse_local_date("   "), None);
        assert_eq!(parse_local_date("TBD"), None);
    }

    #[test]
    fn legacy_and_timestamp_shapes_parse() {
        assert_eq!(parse_local_date("2/3/2025"), Some(ymd(2025, 2, 3)));
        assert_eq!(parse_local_date("Feb 23, 2025"), Some(ymd(2025, 2, 23)));
        assert_eq!(parse_local_date("2025-02-23T08:30:00"), Some(ymd(2025, 2, 23)));
        assert_eq!(
            parse_local_date("Sunday, Feb 23, 2025"),
            Some(ymd(2025, 2, 23))
        );
    }

    #[test]
    fn display_and_month_formats() {
        assert_eq!(format_display_date("2025-02-23"), "Sunday, Feb 23, 2025");
        assert_eq!(format_display_date(NO_DATE), NO_DATE);
        assert_eq!(month_key(ymd(2025, 2, 23)), "Feb 2025");
        assert_eq!(format_short_date(ymd(2025, 2, 3), false), "Feb 3");
        assert_eq!(format_short_date(ymd(2025, 2, 3), true), "Feb 3, 2025");
    }

    #[test]
    fn epoch_conversion_respects_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(epoch_ms_to_date(1_740_268_800_000, Some(utc)), Some(ymd(2025, 2, 23)));
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        assert_eq!(
            epoch_ms_to_date(1_740_268_800_000, Some(pacific)),
            Some(ymd(2025, 2, 22))
        );
    }

    #[test]
    fn no_date_sorts_last() {
        let mut buckets = vec![NO_DATE, "2025-03-01", "2024-12-31", "2025-01-15"];
        buckets.sort_by(|a, b| compare_date_buckets(a, b));
        assert_eq!(buckets, vec!["2024-12-31", "2025-01-15", "2025-03-01", NO_DATE]);
        assert_eq!(compare_date_buckets(NO_DATE, "2099-01-01"), Ordering::Greater);
        assert_eq!(compare_date_buckets("1999-01-01", NO_DATE), Ordering::Less);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let task = reconcile(&record(json!({ "unrelated": 1 })));
        assert_eq!(task.date, NO_DATE);
        assert_eq!(task.status, DEFAULT_STATUS);
        assert_eq!(task.title, DEFAULT_TITLE);
        assert_eq!(task.time, "");
        assert_eq!(task.description, "");
        assert_eq!(task.details, "");
        assert_eq!(task.service_request_id, None);
        assert!(task.milestones().is_empty());
    }

    #[test]
    fn unrecognized_keys_pass_through_unchanged() {
        let input = record(json!({
            "title": "Unit 4B turn",
            "Due Date": "03/14/2025",
            "propertyCode": "RIV",
            "nested": { "a": [1, 2] },
        }));
        let task = reconcile(&input);
        assert_eq!(task.raw.get("propertyCode"), Some(&json!("RIV")));
        assert_eq!(task.raw.get("nested"), Some(&json!({ "a": [1, 2] })));
        assert_eq!(task.raw.get("Due Date"), Some(&json!("03/14/2025")));
        assert!(!task.raw.contains_key("title"));
        assert_eq!(task.date, "2025-03-14");
    }

    #[test]
    fn legacy_export_headers_are_understood() {
        let task = reconcile(&record(json!({
            "Title": "Unit 12 make-ready",
            "Due Date": "2/23/2025",
            "Time": "All Day",
            "Status - StatusId → Name": "In Progress",
            "Service Request Id": 8812,
            "Move In": "Mar 1",
            "Open WOs": "",
        })));
        assert_eq!(task.title, "Unit 12 make-ready");
        assert_eq!(task.date, "2025-02-23");
        assert_eq!(task.time, "");
        assert_eq!(task.status, "In Progress");
        assert_eq!(task.service_request_id.as_deref(), Some("8812"));
        assert_eq!(task.move_in.as_deref(), Some("Mar 1"));
        assert_eq!(task.open_wos, None);
    }

    #[test]
    fn resolved_status_outranks_raw_enum() {
        let task = reconcile(&record(json!({
            "status": "internalDispatch",
            "statusName": "Vendor Scheduled",
        })));
        assert_eq!(task.status, "Vendor Scheduled");
    }

    #[test]
    fn epoch_due_dates_become_buckets() {
        // noon UTC keeps the calendar day stable across host zones
        let task = reconcile(&record(json!({ "dueDate": 1_740_312_000_000_i64 })));
        assert_eq!(task.date, "2025-02-23");
        let code = reconcile(&record(json!({ "dueDate": 42 })));
        assert_eq!(code.date, NO_DATE);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let first = reconcile(&record(json!({
            "Title": "Turn 7C",
            "dueDateFormatted": "2025-04-02",
            "statusName": "Pending Approval",
            "workflowName": "Make Ready",
            "serviceRequestId": "SR-77",
            "moveIn": "Apr 9",
            "extra": true,
        })));
        let as_record = serde_json::to_value(&first).unwrap();
        let second = reconcile(as_record.as_object().unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn task_survives_json_round_trip() {
        let task = reconcile(&record(json!({
            "title": "Paint",
            "date": "2025-05-01",
            "openWOs": "3",
            "vendor": "Acme",
        })));
        let text = serde_json::to_string(&task).unwrap();
        assert!(text.contains("\"openWOs\":\"3\""));
        let back: Task = serde_json::from_str(&text).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn grouping_is_lossless_and_stable() {
        let tasks = vec![
            task_on("2025-03-02", "a"),
            task_on("", "b"),
            task_on("2025-03-02", "c"),
            task_on("2025-01-10", "d"),
        ];
        let groups = group_by_date(tasks.clone());
        let total: usize = groups.iter().map(|g| g.tasks.len()).sum();
        assert_eq!(total, tasks.len());
        let march = groups.iter().find(|g| g.date == "2025-03-02").unwrap();
        let titles = march.tasks.iter().map(|t| t.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["a", "c"]);
        assert!(groups.iter().any(|g| g.date == NO_DATE));
    }

    fn sample_model() -> ReportModel {
        ReportModel::new(vec![
            task_on("2025-01-10", "jan"),
            task_on("", "undated"),
            task_on("2025-03-02", "mar-a"),
            task_on("2025-03-20", "mar-b"),
            task_on("2025-05-05", "may"),
        ])
    }

    #[test]
    fn timeline_groups_months_in_order() {
        let model = sample_model();
        assert_eq!(
            model.sorted_date_buckets(),
            vec!["2025-01-10", "2025-03-02", "2025-03-20", "2025-05-05", NO_DATE]
        );
        let labels = model
            .month_timeline()
            .iter()
            .map(|m| m.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["Jan 2025", "Mar 2025", "May 2025"]);
        assert_eq!(model.month_timeline()[1].dates, vec!["2025-03-02", "2025-03-20"]);

        let all_dates: usize = model.month_groups().iter().map(|m| m.dates.len()).sum();
        assert_eq!(all_dates, model.sorted_date_buckets().len());
        assert_eq!(model.month_groups().last().unwrap().label, NO_DATE);
    }

    #[test]
    fn same_month_name_in_different_years_stays_apart() {
        let model = ReportModel::new(vec![task_on("2024-03-05", "old"), task_on("2025-03-05", "new")]);
        let labels = model
            .month_timeline()
            .iter()
            .map(|m| m.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["Mar 2024", "Mar 2025"]);
    }

    #[test]
    fn default_window_starts_at_current_month() {
        let model = sample_model();
        assert_eq!(
            model.default_window(ymd(2025, 2, 14)),
            Some(DateRange { start: 1, end: 2 })
        );
        assert_eq!(
            model.default_window(ymd(2025, 3, 31)),
            Some(DateRange { start: 1, end: 2 })
        );
        assert_eq!(
            model.default_window(ymd(2026, 1, 1)),
            Some(DateRange { start: 2, end: 2 })
        );
        assert_eq!(ReportModel::new(Vec::new()).default_window(ymd(2025, 1, 1)), None);
    }

    #[test]
    fn set_window_clamps() {
        let model = sample_model();
        assert_eq!(
            model.set_window(DateRange { start: 1, end: 99 }),
            Some(DateRange { start: 1, end: 2 })
        );
        assert_eq!(
            model.set_window(DateRange { start: 2, end: 0 }),
            Some(DateRange { start: 0, end: 0 })
        );
        assert_eq!(model.reset_window(), Some(DateRange { start: 0, end: 2 }));
    }

    #[test]
    fn visible_tasks_follow_window_and_keep_undated() {
        let model = sample_model();
        let full = model.visible_tasks(model.reset_window());
        assert_eq!(full.len(), model.total_tasks());

        let march = model
            .visible_tasks(Some(DateRange { start: 1, end: 1 }))
            .into_iter()
            .map(|t| t.title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(march, vec!["mar-a", "mar-b", "undated"]);

        let view = model.window_view(Some(DateRange { start: 1, end: 2 }));
        assert_eq!(view.range_label, "Mar 2025 - May 2025");
        assert_eq!(view.visible_count, 4);
        assert_eq!(view.total_count, 5);
        assert_eq!(view.groups[0].display_date, "Sunday, Mar 02, 2025");
    }

    #[test]
    fn empty_model_shows_nothing() {
        let model = ReportModel::new(Vec::new());
        assert!(model.visible_tasks(model.reset_window()).is_empty());
        assert_eq!(model.window_view(None).range_label, "No dated tasks");
    }

    #[test]
    fn status_categories_follow_priority() {
        assert_eq!(StatusCategory::classify("Completed"), StatusCategory::Complete);
        assert_eq!(StatusCategory::classify("IN PROGRESS"), StatusCategory::InProgress);
        assert_eq!(StatusCategory::classify("Waiting for Parts"), StatusCategory::Pending);
        assert_eq!(StatusCategory::classify("Late"), StatusCategory::Overdue);
        assert_eq!(StatusCategory::classify("Cancelled"), StatusCategory::Cancelled);
        assert_eq!(StatusCategory::classify("Internal Dispatch"), StatusCategory::Other);
        // complete is checked before cancelled
        assert_eq!(
            StatusCategory::classify("Completed - cancelled remainder"),
            StatusCategory::Complete
        );
        assert_eq!(StatusCategory::InProgress.as_str(), "in-progress");
    }
}
