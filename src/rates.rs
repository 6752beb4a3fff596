use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub no4: String,
    pub group_id: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct DayRecord {
    pub no4: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateRow {
    pub no4: String,
    #[serde(rename = "groupId")]
    pub group_id: String,
    pub email: String,
    pub present: u64,
    pub late: u64,
    pub early: u64,
    pub absent: u64,
    pub missing: u64,
    pub total: u64,
    pub rate: f64,
}

/// Half-up rounding of `attended/total` to one decimal percent:
/// `floor(1000*x + 0.5) / 10`. Zero when there are no counted days.
pub fn rate_percent(attended: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((1000.0 * attended as f64 / total as f64) + 0.5).floor() / 10.0
}

/// Per-student attendance totals over the counted days. A day with no record
/// for a student is "missing"; so is a record with an unknown status.
pub fn aggregate_rates(
    students: &[StudentRef],
    day_ids: &[String],
    records_by_day: &HashMap<String, Vec<DayRecord>>,
) -> Vec<RateRow> {
    let total = day_ids.len() as u64;
    students
        .iter()
        .map(|s| {
            let mut present = 0u64;
            let mut late = 0u64;
            let mut early = 0u64;
            let mut absent = 0u64;
            let mut missing = 0u64;
            for day_id in day_ids {
                let rec = records_by_day
                    .get(day_id)
                    .and_then(|recs| recs.iter().find(|r| r.no4 == s.no4));
                match rec.map(|r| r.status.as_str()) {
                    Some("present") => present += 1,
                    Some("late") => late += 1,
                    Some("early") => early += 1,
                    Some("absent") => absent += 1,
                    _ => missing += 1,
                }
            }
            let attended = present + late + early;
            RateRow {
                no4: s.no4.clone(),
                group_id: s.group_id.clone(),
                email: s.email.clone(),
                present,
                late,
                early,
                absent,
                missing,
                total,
                rate: rate_percent(attended, total),
            }
        })
        .collect()
}
