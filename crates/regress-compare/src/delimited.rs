use crate::{ComparisonResult, Method, Outcome};
use std::fs;
use std::path::Path;

const MISSING_FIELD: &str = "<missing>";

pub(crate) fn compare_delimited(
    reference: &Path,
    candidate: &Path,
    delimiter: char,
    method: Method,
) -> ComparisonResult {
    let (ref_text, cand_text) = match (fs::read(reference), fs::read(candidate)) {
        (Ok(r), Ok(c)) => (
            String::from_utf8_lossy(&r).into_owned(),
            String::from_utf8_lossy(&c).into_owned(),
        ),
        (Err(e), _) | (_, Err(e)) => {
            return ComparisonResult::new(Outcome::Error, method, candidate)
                .with_detail(format!("Failed to read delimited outputs: {}", e));
        }
    };

    // Lines keep their terminators so a CRLF or missing final newline counts.
    let ref_lines: Vec<&str> = ref_text.split_inclusive('\n').collect();
    let cand_lines: Vec<&str> = cand_text.split_inclusive('\n').collect();
    if ref_lines.len() != cand_lines.len() {
        return ComparisonResult::new(Outcome::Fail, method, candidate).with_detail(format!(
            "Reference output {} has {} lines but test output {} has {} lines",
            reference.display(),
            ref_lines.len(),
            candidate.display(),
            cand_lines.len()
        ));
    }

    for (idx, (r, c)) in ref_lines.iter().zip(cand_lines.iter()).enumerate() {
        if r == c {
            continue;
        }
        let line_no = idx + 1;
        let (r_body, r_end) = split_terminator(r);
        let (c_body, c_end) = split_terminator(c);
        let mut res = ComparisonResult::new(Outcome::Fail, method, candidate);
        if r_body == c_body {
            res.detail = format!(
                "Line {} of {} differs only in its terminator: reference {:?} vs test {:?}",
                line_no,
                reference.display(),
                r_end,
                c_end
            );
            res.mismatches
                .push(format!("line {} terminator: {:?} vs {:?}", line_no, r_end, c_end));
            return res;
        }
        let (field, ref_val, cand_val) = first_differing_field(r_body, c_body, delimiter);
        res.detail = format!(
            "First mismatch at line {} of {} column {}: reference line...\n{}\nvs test line...\n{}\n{} vs {}",
            line_no,
            reference.display(),
            field,
            r_body,
            c_body,
            ref_val,
            cand_val
        );
        res.mismatches.push(format!(
            "line {} field {}: {} vs {}",
            line_no, field, ref_val, cand_val
        ));
        return res;
    }

    // Lossy decoding can fold distinct invalid bytes into the same text.
    ComparisonResult::new(Outcome::Fail, method, candidate)
        .with_detail("Delimited outputs differ in bytes that do not decode as text.")
}

/// Splits a line into its content and its `\n` or `\r\n` terminator.
fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Index (0-based) and values of the first field that differs between two
/// unequal lines. A field absent on one side is reported as `<missing>`.
fn first_differing_field<'a>(r: &'a str, c: &'a str, delimiter: char) -> (usize, &'a str, &'a str) {
    let r_fields: Vec<&str> = r.split(delimiter).collect();
    let c_fields: Vec<&str> = c.split(delimiter).collect();
    let width = r_fields.len().max(c_fields.len());
    for i in 0..width {
        let rv = r_fields.get(i).copied().unwrap_or(MISSING_FIELD);
        let cv = c_fields.get(i).copied().unwrap_or(MISSING_FIELD);
        if rv != cv {
            return (i, rv, cv);
        }
    }
    (width, MISSING_FIELD, MISSING_FIELD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::temp_root;
    use crate::{compare, CompareOptions, ReportKind};

    fn rows(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{},{},{}", i, i * 10, i * 100)).collect()
    }

    #[test]
    fn line_count_mismatch_cites_both_counts() {
        let root = temp_root("csv_counts");
        let r = root.join("ref.csv");
        let c = root.join("ReportHIVByAgeAndGender.csv");
        fs::write(&r, rows(10).join("\n") + "\n").unwrap();
        fs::write(&c, rows(9).join("\n") + "\n").unwrap();

        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert_eq!(
            res.method,
            Method::Structural(ReportKind::Delimited { delimiter: ',' })
        );
        assert!(res.detail.contains("has 10 lines"), "{}", res.detail);
        assert!(res.detail.contains("has 9 lines"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reports_first_differing_line_and_field() {
        let root = temp_root("csv_field");
        let r = root.join("ref.csv");
        let c = root.join("cand.csv");
        let reference = rows(8);
        let mut cand = reference.clone();
        cand[4] = "4,40,999".to_string();
        cand[6] = "x,y,z".to_string();
        fs::write(&r, reference.join("\n")).unwrap();
        fs::write(&c, cand.join("\n")).unwrap();

        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.starts_with("First mismatch at line 5"), "{}", res.detail);
        assert!(res.detail.contains("column 2"), "{}", res.detail);
        assert!(res.detail.ends_with("400 vs 999"), "{}", res.detail);
        assert_eq!(res.mismatches, vec!["line 5 field 2: 400 vs 999".to_string()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_final_newline_fails() {
        let root = temp_root("csv_eof");
        let r = root.join("ref.csv");
        let c = root.join("cand.csv");
        fs::write(&r, "a,b\n1,2\n").unwrap();
        fs::write(&c, "a,b\n1,2").unwrap();
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.starts_with("Line 2 of"), "{}", res.detail);
        assert!(res.detail.ends_with("reference \"\\n\" vs test \"\""), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn crlf_against_lf_fails() {
        let root = temp_root("csv_crlf");
        let r = root.join("ref.csv");
        let c = root.join("cand.csv");
        fs::write(&r, "a,b\n1,2\n").unwrap();
        fs::write(&c, "a,b\r\n1,2\r\n").unwrap();
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.warnings.is_empty());
        assert_eq!(
            res.mismatches,
            vec!["line 1 terminator: \"\\n\" vs \"\\r\\n\"".to_string()]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn terminators_are_split_from_content() {
        assert_eq!(split_terminator("1,2\r\n"), ("1,2", "\r\n"));
        assert_eq!(split_terminator("1,2\n"), ("1,2", "\n"));
        assert_eq!(split_terminator("1,2"), ("1,2", ""));
    }

    #[test]
    fn extra_trailing_field_is_reported_as_missing() {
        assert_eq!(first_differing_field("1,2", "1,2,3", ','), (2, "<missing>", "3"));
    }
}
