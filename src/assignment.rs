//! Batch distribution of unassigned active students into capacity-bounded
//! classes for one grade level. Each student is its own committed unit, so an
//! interrupted run leaves no half-applied student and a re-run picks up only
//! the students still unassigned (selection filters class_id IS NULL).

use crate::coordinator::{self, CacheHooks, Entity};
use crate::enrollment;
use crate::model::{validate_academic_year, ClassRow, OpError};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

pub const DEFAULT_MAX_STUDENTS_PER_CLASS: i64 = 30;
pub const AUTO_ASSIGN_NOTES: &str = "Auto-assigned by system";

pub struct AssignParams {
    pub grade_level: i64,
    pub academic_year: String,
    pub max_students_per_class: i64,
}

#[derive(Debug)]
pub struct Assignment {
    pub student_id: String,
    pub student_name: String,
    pub class_id: String,
    pub class_name: String,
}

#[derive(Debug)]
pub struct SkippedStudent {
    pub student_id: String,
    pub student_name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct AssignOutcome {
    pub total_assigned: usize,
    pub assignments: Vec<Assignment>,
    pub skipped: Vec<SkippedStudent>,
    /// Set when a non-recoverable error stopped the batch; everything in
    /// `assignments` before it is already committed.
    pub aborted: Option<String>,
}

impl AssignOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "totalAssigned": self.total_assigned,
            "assignments": self.assignments.iter().map(|a| json!({
                "studentId": a.student_id,
                "studentName": a.student_name,
                "classId": a.class_id,
                "className": a.class_name,
            })).collect::<Vec<_>>(),
            "skipped": self.skipped.iter().map(|s| json!({
                "studentId": s.student_id,
                "studentName": s.student_name,
                "reason": s.reason,
            })).collect::<Vec<_>>(),
            "aborted": self.aborted,
        })
    }
}

struct Slot {
    class: ClassRow,
    remaining: i64,
}

pub fn auto_assign(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    p: AssignParams,
) -> Result<AssignOutcome, OpError> {
    validate_academic_year(&p.academic_year)?;
    if p.grade_level <= 0 {
        return Err(OpError::Validation(format!(
            "gradeLevel must be positive: {}",
            p.grade_level
        )));
    }
    if p.max_students_per_class <= 0 {
        return Err(OpError::Validation(format!(
            "maxStudentsPerClass must be positive: {}",
            p.max_students_per_class
        )));
    }

    // Stable student order makes the whole distribution reproducible.
    let students: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, last_name, first_name FROM students
             WHERE status = 'active' AND class_id IS NULL
             ORDER BY last_name, first_name, id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok((r.get::<_, String>(0)?, format!("{}, {}", last, first)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut slots = load_slots(conn, &p)?;
    let mut cursor = 0usize;
    let mut outcome = AssignOutcome::default();
    let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();

    'students: for (student_id, student_name) in students {
        loop {
            while cursor < slots.len() && slots[cursor].remaining <= 0 {
                cursor += 1;
            }
            if cursor >= slots.len() {
                match synthesize_class(conn, cache, actor_id, &p, &slots) {
                    Ok(class) => {
                        let remaining = class.max_students.min(p.max_students_per_class);
                        slots.push(Slot { class, remaining });
                    }
                    Err(e) => {
                        outcome.aborted = Some(e.to_string());
                        break 'students;
                    }
                }
            }

            let slot = &mut slots[cursor];
            let res = coordinator::run_unit(conn, cache, |tx, fx| {
                enrollment::insert_approved(
                    tx,
                    fx,
                    actor_id,
                    &student_id,
                    &slot.class,
                    &today,
                    AUTO_ASSIGN_NOTES,
                )
            });
            match res {
                Ok(_) => {
                    slot.remaining -= 1;
                    outcome.assignments.push(Assignment {
                        student_id: student_id.clone(),
                        student_name: student_name.clone(),
                        class_id: slot.class.id.clone(),
                        class_name: slot.class.name.clone(),
                    });
                    continue 'students;
                }
                // The seat gate lost a race for this class: spill to the next
                // one and retry the same student.
                Err(OpError::CapacityExceeded(_)) => {
                    slot.remaining = 0;
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    outcome.skipped.push(SkippedStudent {
                        student_id: student_id.clone(),
                        student_name: student_name.clone(),
                        reason: e.message(),
                    });
                    continue 'students;
                }
                Err(e) => {
                    outcome.aborted = Some(e.to_string());
                    break 'students;
                }
            }
        }
    }

    outcome.total_assigned = outcome.assignments.len();
    Ok(outcome)
}

fn load_slots(conn: &Connection, p: &AssignParams) -> Result<Vec<Slot>, OpError> {
    let mut stmt = conn.prepare(
        "SELECT id, code, name, grade_level, academic_year, max_students, student_count
         FROM classes WHERE grade_level = ? AND academic_year = ?
         ORDER BY name",
    )?;
    let classes = stmt
        .query_map((p.grade_level, &p.academic_year), enrollment::map_class_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(classes
        .into_iter()
        .map(|class| {
            // Fill up to the smaller of the class's own cap and this run's
            // per-class limit; reserve_seat stays the hard gate underneath.
            let target = class.max_students.min(p.max_students_per_class);
            let remaining = (target - class.student_count).max(0);
            Slot { class, remaining }
        })
        .collect())
}

/// Creates the next overflow class "{grade}A{n}" for the grade/year. Walks n
/// past codes already taken so a re-run lands on a fresh one.
fn synthesize_class(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    p: &AssignParams,
    slots: &[Slot],
) -> Result<ClassRow, OpError> {
    let mut n = slots.len() as i64 + 1;
    loop {
        let code = format!("{}A{}", p.grade_level, n);
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM classes WHERE code = ? AND academic_year = ?",
            (&code, &p.academic_year),
            |r| r.get(0),
        )?;
        if taken > 0 {
            n += 1;
            continue;
        }

        let class = ClassRow {
            id: Uuid::new_v4().to_string(),
            name: format!("Class {}", code),
            code,
            grade_level: p.grade_level,
            academic_year: p.academic_year.clone(),
            max_students: p.max_students_per_class,
            student_count: 0,
        };
        return coordinator::run_unit(conn, cache, |tx, fx| {
            tx.execute(
                "INSERT INTO classes(id, code, name, grade_level, academic_year, max_students, student_count)
                 VALUES(?, ?, ?, ?, ?, ?, 0)",
                (
                    &class.id,
                    &class.code,
                    &class.name,
                    class.grade_level,
                    &class.academic_year,
                    class.max_students,
                ),
            )?;
            fx.invalidate(Entity::Class, &class.id);
            fx.audit(
                actor_id,
                "class.synthesize",
                Entity::Class,
                &class.id,
                Some(json!({ "code": class.code, "academicYear": class.academic_year })),
            );
            Ok(class.clone())
        });
    }
}
