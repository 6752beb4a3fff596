use std::collections::HashMap;

/// Column-guessing keyword lists for roster CSV headers. These reproduce the
/// survey-export headers seen in the field and are policy, not a contract:
/// matching is substring-based on normalized header text.
const STRONG_NUMBER_KEYWORDS: [&str; 4] = ["学籍番号", "学生番号", "学籍no", "学籍"];
const WEAK_NUMBER_KEYWORDS: [&str; 3] = ["番号", "no4", "no"];
/// Headers containing these never count as a weak number match. Keeps the
/// importer off survey metadata columns like "回答ID" or "タイムスタンプ".
const NUMBER_EXCLUDES: [&str; 3] = ["id", "回答", "タイム"];
const EMAIL_KEYWORDS: [&str; 5] = ["メールアドレス", "メール", "e-mail", "email", "mail"];
const GROUP_KEYWORDS: [&str; 5] = ["所属班", "班", "クラス", "グループ", "group"];

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub no4: String,
    pub email: String,
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportPlan {
    pub rows: Vec<ImportRow>,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportError {
    Empty,
    MissingColumns {
        number: bool,
        email: bool,
        group: bool,
    },
}

/// Splits one CSV line respecting quoted fields and doubled-quote escapes.
/// Cells are BOM-stripped and trimmed.
pub fn parse_csv_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                cur.push('"');
                chars.next();
                continue;
            }
            in_quotes = !in_quotes;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(cur);
            cur = String::new();
            continue;
        }
        cur.push(ch);
    }
    out.push(cur);
    out.iter()
        .map(|s| s.trim_start_matches('\u{feff}').trim().to_string())
        .collect()
}

/// Strips the BOM, drops all whitespace (including full-width spaces) and
/// lowercases, so header matching ignores formatting noise.
fn normalize_header(s: &str) -> String {
    s.trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{3000}')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn find_header_index<F>(headers: &[String], needles: &[&str], exclude: F) -> Option<usize>
where
    F: Fn(&str) -> bool,
{
    let needles: Vec<String> = needles.iter().map(|n| normalize_header(n)).collect();
    for (i, raw) in headers.iter().enumerate() {
        let h = normalize_header(raw);
        if exclude(&h) {
            continue;
        }
        for n in &needles {
            if !n.is_empty() && h.contains(n.as_str()) {
                return Some(i);
            }
        }
    }
    None
}

fn pick_number_index(headers: &[String]) -> Option<usize> {
    if let Some(i) = find_header_index(headers, &STRONG_NUMBER_KEYWORDS, |_| false) {
        return Some(i);
    }
    find_header_index(headers, &WEAK_NUMBER_KEYWORDS, |h| {
        NUMBER_EXCLUDES.iter().any(|x| h.contains(x))
    })
}

/// The generic labels a form builder emits for its built-in email column.
fn is_default_email_header(raw: &str) -> bool {
    let n = normalize_header(raw);
    n == "メール" || n == "メールアドレス"
}

/// When a sheet carries both the form's default email column and a
/// hand-entered one, prefer the hand-entered one.
fn pick_email_index(headers: &[String]) -> Option<usize> {
    let needles: Vec<String> = EMAIL_KEYWORDS.iter().map(|n| normalize_header(n)).collect();
    let mut candidates = Vec::new();
    for (i, raw) in headers.iter().enumerate() {
        let h = normalize_header(raw);
        if needles.iter().any(|n| !n.is_empty() && h.contains(n.as_str())) {
            candidates.push(i);
        }
    }
    if candidates.len() <= 1 {
        return candidates.first().copied();
    }
    candidates
        .iter()
        .copied()
        .find(|&i| !is_default_email_header(&headers[i]))
        .or_else(|| candidates.first().copied())
}

fn pick_group_index(headers: &[String]) -> Option<usize> {
    find_header_index(headers, &GROUP_KEYWORDS, |_| false)
}

/// Plans a roster import from raw CSV text. `group_lookup` maps lowercased
/// group ids and display names to canonical group ids; unmatched group cells
/// fall through as literal ids. Malformed rows are counted, never fatal;
/// a missing required column aborts the whole import before any write.
pub fn plan_import(
    csv: &str,
    group_lookup: &HashMap<String, String>,
) -> Result<ImportPlan, ImportError> {
    let lines: Vec<&str> = csv
        .split(['\r', '\n'])
        .filter(|l| !l.trim().is_empty())
        .collect();
    let Some((header_line, data_lines)) = lines.split_first() else {
        return Err(ImportError::Empty);
    };

    let headers = parse_csv_line(header_line);
    let idx_no = pick_number_index(&headers);
    let idx_email = pick_email_index(&headers);
    let idx_group = pick_group_index(&headers);
    let (Some(idx_no), Some(idx_email), Some(idx_group)) = (idx_no, idx_email, idx_group) else {
        return Err(ImportError::MissingColumns {
            number: idx_no.is_none(),
            email: idx_email.is_none(),
            group: idx_group.is_none(),
        });
    };

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for line in data_lines {
        let cols = parse_csv_line(line);
        let mut no4: String = cols
            .get(idx_no)
            .map(|c| c.chars().filter(|ch| ch.is_ascii_digit()).collect())
            .unwrap_or_default();
        let email = cols.get(idx_email).map(|c| c.trim().to_string()).unwrap_or_default();
        let group_raw = cols.get(idx_group).map(|c| c.trim().to_string()).unwrap_or_default();
        let group_id = group_lookup
            .get(&group_raw.to_lowercase())
            .cloned()
            .unwrap_or(group_raw);
        if no4.is_empty() || email.is_empty() || group_id.is_empty() {
            skipped += 1;
            continue;
        }
        if no4.len() < 4 {
            no4 = format!("{:0>4}", no4);
        }
        if no4.len() != 4 {
            skipped += 1;
            continue;
        }
        rows.push(ImportRow {
            no4,
            email,
            group_id,
        });
    }

    Ok(ImportPlan { rows, skipped })
}
