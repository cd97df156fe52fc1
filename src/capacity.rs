//! Capacity gating for class occupancy. Every caller that goes on to write an
//! approved enrollment must hold the same transaction it checked under;
//! `reserve_seat` folds the check and the increment into one statement so two
//! writers can never both observe a free seat.

use crate::model::OpError;
use rusqlite::{Connection, OptionalExtension};

pub fn can_accept(conn: &Connection, class_id: &str, academic_year: &str) -> Result<bool, OpError> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT c.max_students,
                    (SELECT COUNT(*) FROM enrollments e
                     WHERE e.class_id = c.id AND e.academic_year = ? AND e.status = 'approved')
             FROM classes c WHERE c.id = ?",
            (academic_year, class_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((max_students, approved)) = row else {
        return Err(OpError::NotFound(format!("class not found: {}", class_id)));
    };
    Ok(approved < max_students)
}

/// Compare-and-increment on the occupancy counter. Returns false when the
/// class is already full; never over-admits even with interleaved callers.
pub fn reserve_seat(conn: &Connection, class_id: &str) -> Result<bool, OpError> {
    let changed = conn.execute(
        "UPDATE classes SET student_count = student_count + 1
         WHERE id = ? AND student_count < max_students",
        [class_id],
    )?;
    Ok(changed == 1)
}

pub fn release_seat(conn: &Connection, class_id: &str) -> Result<(), OpError> {
    conn.execute(
        "UPDATE classes SET student_count = student_count - 1
         WHERE id = ? AND student_count > 0",
        [class_id],
    )?;
    Ok(())
}
