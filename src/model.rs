use serde_json::json;

/// Closed enrollment lifecycle. PENDING is the only non-terminal state;
/// APPROVED can only be undone by deleting the row, never by a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Pending,
    Approved,
    Rejected,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentStatus {
    Active,
    Inactive,
    Graduated,
}

impl StudentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Graduated => "graduated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "graduated" => Some(Self::Graduated),
            _ => None,
        }
    }
}

/// Domain error taxonomy. Single-record operations fail fast with one of
/// these and apply nothing; the batch engines treat Conflict and
/// CapacityExceeded as recoverable per item and only abort on Db.
#[derive(Debug)]
pub enum OpError {
    NotFound(String),
    Conflict(String),
    CapacityExceeded(String),
    InvalidTransition(String),
    Validation(String),
    Db(rusqlite::Error),
}

impl OpError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Validation(_) => "bad_params",
            Self::Db(_) => "db_failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotFound(m)
            | Self::Conflict(m)
            | Self::CapacityExceeded(m)
            | Self::InvalidTransition(m)
            | Self::Validation(m) => m.clone(),
            Self::Db(e) => e.to_string(),
        }
    }

    /// Recoverable within a batch: skip the item, keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::CapacityExceeded(_))
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for OpError {}

impl From<rusqlite::Error> for OpError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e)
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRow {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub academic_year: String,
    pub enrollment_date: String,
    pub status: EnrollmentStatus,
    pub notes: Option<String>,
}

impl EnrollmentRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "classId": self.class_id,
            "academicYear": self.academic_year,
            "enrollmentDate": self.enrollment_date,
            "status": self.status.as_str(),
            "notes": self.notes,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub grade_level: i64,
    pub academic_year: String,
    pub max_students: i64,
    pub student_count: i64,
}

/// Academic years are written "2024-2025": two 4-digit years, the second
/// exactly one ahead of the first.
pub fn validate_academic_year(s: &str) -> Result<(), OpError> {
    let bad = || OpError::Validation(format!("academicYear must be YYYY-YYYY: {}", s));
    let (a, b) = s.split_once('-').ok_or_else(bad)?;
    if a.len() != 4 || b.len() != 4 {
        return Err(bad());
    }
    let start: i32 = a.parse().map_err(|_| bad())?;
    let end: i32 = b.parse().map_err(|_| bad())?;
    if end != start + 1 {
        return Err(OpError::Validation(format!(
            "academicYear end must follow start: {}",
            s
        )));
    }
    Ok(())
}

/// "2025-2026" -> "2026-2027". Fails Validation on malformed input.
pub fn next_academic_year(s: &str) -> Result<String, OpError> {
    validate_academic_year(s)?;
    let start: i32 = s[..4]
        .parse()
        .map_err(|_| OpError::Validation(format!("bad academicYear: {}", s)))?;
    Ok(format!("{}-{}", start + 1, start + 2))
}

pub fn validate_enrollment_date(s: &str) -> Result<(), OpError> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| OpError::Validation(format!("enrollmentDate must be YYYY-MM-DD: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_case_insensitive_and_closed() {
        assert_eq!(EnrollmentStatus::parse("PENDING"), Some(EnrollmentStatus::Pending));
        assert_eq!(EnrollmentStatus::parse("Approved"), Some(EnrollmentStatus::Approved));
        assert_eq!(EnrollmentStatus::parse(" rejected "), Some(EnrollmentStatus::Rejected));
        assert_eq!(EnrollmentStatus::parse("deleted"), None);
        assert_eq!(EnrollmentStatus::parse(""), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!EnrollmentStatus::Pending.is_terminal());
        assert!(EnrollmentStatus::Approved.is_terminal());
        assert!(EnrollmentStatus::Rejected.is_terminal());
    }

    #[test]
    fn academic_year_validation() {
        assert!(validate_academic_year("2024-2025").is_ok());
        assert!(validate_academic_year("2024-2026").is_err());
        assert!(validate_academic_year("2024").is_err());
        assert!(validate_academic_year("24-25").is_err());
        assert_eq!(next_academic_year("2024-2025").expect("next year"), "2025-2026");
    }

    #[test]
    fn enrollment_date_validation() {
        assert!(validate_enrollment_date("2024-09-01").is_ok());
        assert!(validate_enrollment_date("2024-13-01").is_err());
        assert!(validate_enrollment_date("yesterday").is_err());
    }
}
