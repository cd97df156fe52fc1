//! Grade-cohort promotion: every active student approved into the source
//! grade/year gets a fresh APPROVED enrollment in a destination class one
//! grade up under the new year. Prior-year rows are never touched; each
//! student is an independent unit and a failure on one never stops the rest.

use crate::assignment::DEFAULT_MAX_STUDENTS_PER_CLASS;
use crate::coordinator::{self, CacheHooks, Entity};
use crate::enrollment;
use crate::model::{validate_academic_year, ClassRow, OpError};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

pub struct PromoteParams {
    pub current_grade_level: i64,
    pub current_academic_year: String,
    pub new_academic_year: String,
}

#[derive(Debug)]
pub struct Promotion {
    pub student_id: String,
    pub student_name: String,
    pub from_class_id: String,
    pub to_class_id: String,
    pub to_class_name: String,
}

#[derive(Debug)]
pub struct PromotionFailure {
    pub student_id: String,
    pub student_name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct PromoteOutcome {
    pub total_promoted: usize,
    pub promotions: Vec<Promotion>,
    pub failures: Vec<PromotionFailure>,
    /// Non-recoverable abort; promotions listed before it are committed.
    pub aborted: Option<String>,
}

impl PromoteOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "totalPromoted": self.total_promoted,
            "promotions": self.promotions.iter().map(|p| json!({
                "studentId": p.student_id,
                "studentName": p.student_name,
                "fromClassId": p.from_class_id,
                "toClassId": p.to_class_id,
                "toClassName": p.to_class_name,
            })).collect::<Vec<_>>(),
            "failures": self.failures.iter().map(|f| json!({
                "studentId": f.student_id,
                "studentName": f.student_name,
                "reason": f.reason,
            })).collect::<Vec<_>>(),
            "aborted": self.aborted,
        })
    }
}

struct Candidate {
    student_id: String,
    student_name: String,
    from_class_id: String,
}

pub fn promote(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    p: PromoteParams,
) -> Result<PromoteOutcome, OpError> {
    validate_academic_year(&p.current_academic_year)?;
    validate_academic_year(&p.new_academic_year)?;
    if p.new_academic_year == p.current_academic_year {
        return Err(OpError::Validation(
            "newAcademicYear must differ from currentAcademicYear".to_string(),
        ));
    }
    if p.current_grade_level <= 0 {
        return Err(OpError::Validation(format!(
            "currentGradeLevel must be positive: {}",
            p.current_grade_level
        )));
    }

    // Students already holding a live enrollment for the new year are the
    // ones a previous (possibly interrupted) run processed; excluding them
    // here is what makes re-invocation safe.
    let candidates: Vec<Candidate> = {
        let mut stmt = conn.prepare(
            "SELECT s.id, s.last_name, s.first_name, c.id
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
                AND e.academic_year = ? AND e.status = 'approved'
             JOIN classes c ON c.id = e.class_id
             WHERE s.status = 'active' AND c.grade_level = ?
               AND NOT EXISTS (
                 SELECT 1 FROM enrollments e2
                 WHERE e2.student_id = s.id AND e2.academic_year = ?
                   AND e2.status IN ('pending', 'approved')
               )
             ORDER BY s.last_name, s.first_name, s.id",
        )?;
        let rows = stmt
            .query_map(
                (&p.current_academic_year, p.current_grade_level, &p.new_academic_year),
                |r| {
                    let last: String = r.get(1)?;
                    let first: String = r.get(2)?;
                    Ok(Candidate {
                        student_id: r.get(0)?,
                        student_name: format!("{}, {}", last, first),
                        from_class_id: r.get(3)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let new_grade = p.current_grade_level + 1;
    let mut destinations = load_destinations(conn, new_grade, &p.new_academic_year)?;
    let mut outcome = PromoteOutcome::default();
    let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
    let notes = format!(
        "Promoted from grade {} ({})",
        p.current_grade_level, p.current_academic_year
    );

    'students: for cand in candidates {
        loop {
            let dest_idx = destinations.iter().position(|d| d.student_count < d.max_students);
            let dest_idx = match dest_idx {
                Some(i) => i,
                None => {
                    match create_destination(conn, cache, actor_id, new_grade, &p.new_academic_year) {
                        Ok(class) => {
                            destinations.push(class);
                            destinations.len() - 1
                        }
                        Err(e) => {
                            outcome.aborted = Some(e.to_string());
                            break 'students;
                        }
                    }
                }
            };

            let dest = &mut destinations[dest_idx];
            let res = coordinator::run_unit(conn, cache, |tx, fx| {
                enrollment::insert_approved(
                    tx,
                    fx,
                    actor_id,
                    &cand.student_id,
                    dest,
                    &today,
                    &notes,
                )
            });
            match res {
                Ok(_) => {
                    dest.student_count += 1;
                    outcome.promotions.push(Promotion {
                        student_id: cand.student_id.clone(),
                        student_name: cand.student_name.clone(),
                        from_class_id: cand.from_class_id.clone(),
                        to_class_id: dest.id.clone(),
                        to_class_name: dest.name.clone(),
                    });
                    continue 'students;
                }
                // Lost a capacity race on this destination: stop considering
                // it and retry the same student elsewhere.
                Err(OpError::CapacityExceeded(_)) => {
                    dest.student_count = dest.max_students;
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    outcome.failures.push(PromotionFailure {
                        student_id: cand.student_id.clone(),
                        student_name: cand.student_name.clone(),
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

    outcome.total_promoted = outcome.promotions.len();
    Ok(outcome)
}

fn load_destinations(
    conn: &Connection,
    grade_level: i64,
    academic_year: &str,
) -> Result<Vec<ClassRow>, OpError> {
    let mut stmt = conn.prepare(
        "SELECT id, code, name, grade_level, academic_year, max_students, student_count
         FROM classes WHERE grade_level = ? AND academic_year = ?
         ORDER BY name",
    )?;
    let rows = stmt
        .query_map((grade_level, academic_year), enrollment::map_class_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn create_destination(
    conn: &Connection,
    cache: &dyn CacheHooks,
    actor_id: &str,
    grade_level: i64,
    academic_year: &str,
) -> Result<ClassRow, OpError> {
    let mut n = 1i64;
    loop {
        let code = format!("{}A{}", grade_level, n);
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM classes WHERE code = ? AND academic_year = ?",
            (&code, academic_year),
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
            grade_level,
            academic_year: academic_year.to_string(),
            max_students: DEFAULT_MAX_STUDENTS_PER_CLASS,
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
