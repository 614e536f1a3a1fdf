//! Closed vocabularies for survey and lab codes
//!
//! Every mapper is a pure function over a trimmed, lower-cased raw value:
//! `Ok(Some(term))` for a known code, `Ok(None)` for a code that means
//! "no answer", and a [`VocabularyError`] for anything else. Absent inputs are
//! the caller's business; mappers only ever see present values.

mod clinical;
mod demographics;

pub use clinical::{discharge_disposition, icd10, symptom, vaccine_status};
pub use demographics::{hispanic_latino, insurance, race, sex};

use thiserror::Error;

/// One variant per vocabulary so a failing mapper can be found by its message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VocabularyError {
    #[error("Unknown race: {0:?}")]
    UnknownRace(String),
    #[error("Unknown ethnicity: {0:?}")]
    UnknownEthnicity(String),
    #[error("Unknown sex: {0:?}")]
    UnknownSex(String),
    #[error("Unknown vaccine status: {0:?}")]
    UnknownVaccineStatus(String),
    #[error("Unknown insurance type: {0:?}")]
    UnknownInsurance(String),
    #[error("Unknown symptom: {0:?}")]
    UnknownSymptom(String),
    #[error("Unknown discharge disposition: {0:?}")]
    UnknownDischargeDisposition(String),
    #[error("Unknown ICD-10 code: {0:?}")]
    UnknownIcd10(String),
    #[error("Unknown yes/no answer: {0:?}")]
    UnknownYesNo(String),
    #[error("Unknown site: {0:?}")]
    UnknownSite(String),
}

pub type VocabResult<T> = std::result::Result<T, VocabularyError>;

/// Ages above this are reported as this value.
pub const AGE_CEILING: f64 = 85.0;

pub fn age_ceiling(age: f64) -> f64 {
    age.min(AGE_CEILING)
}

pub(crate) fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Answers that carry no information and map to absence in every vocabulary.
pub fn is_no_answer(raw: &str) -> bool {
    matches!(
        normalize(raw).as_str(),
        "" | "unknown"
            | "refused"
            | "declined"
            | "patient declined"
            | "prefer not to say"
            | "prefer_not_to_say"
            | "prefer not to answer"
            | "not reported"
            | "n/a"
            | "na"
    )
}

/// Whether a single-valued answer is the "prefer not to say" sentinel.
pub fn is_prefer_not_to_say(raw: &str) -> bool {
    matches!(
        normalize(raw).as_str(),
        "prefer not to say" | "prefer_not_to_say" | "prefer not to answer" | "refused"
    )
}

pub fn yes_no(raw: &str) -> VocabResult<Option<bool>> {
    let value = normalize(raw);
    match value.as_str() {
        "yes" | "y" | "true" | "1" | "checked" => Ok(Some(true)),
        "no" | "n" | "false" | "0" | "unchecked" => Ok(Some(false)),
        "dont know" | "dont_know" | "don't know" | "do not know" | "not sure" => Ok(None),
        _ if is_no_answer(&value) => Ok(None),
        _ => Err(VocabularyError::UnknownYesNo(raw.to_string())),
    }
}

/// Merge "select all that apply" inputs into one deduplicated list of terms.
///
/// Each input may itself be pipe-delimited. Order of first appearance is kept.
pub fn merge_coded<'a, I, F>(values: I, mapper: F) -> VocabResult<Vec<&'static str>>
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> VocabResult<Option<&'static str>>,
{
    let mut terms: Vec<&'static str> = Vec::new();
    for value in values {
        for part in value.split('|') {
            if part.trim().is_empty() {
                continue;
            }
            if let Some(term) = mapper(part)? {
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
        }
    }
    Ok(terms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_delimited_race_is_split_and_normalized() {
        let races = merge_coded(["black|white"], race).unwrap();
        assert_eq!(races, vec!["blackOrAfricanAmerican", "white"]);
    }

    #[test]
    fn merge_deduplicates_and_drops_no_answer() {
        let races = merge_coded(["White", "caucasian|refused", "Asian"], race).unwrap();
        assert_eq!(races, vec!["white", "asian"]);
    }

    #[test]
    fn merge_propagates_first_unknown_code() {
        let err = merge_coded(["white|martian"], race).unwrap_err();
        assert_eq!(err, VocabularyError::UnknownRace("martian".into()));
    }

    #[test]
    fn yes_no_answers() {
        assert_eq!(yes_no("Yes").unwrap(), Some(true));
        assert_eq!(yes_no(" 0 ").unwrap(), Some(false));
        assert_eq!(yes_no("don't know").unwrap(), None);
        assert_eq!(yes_no("prefer not to say").unwrap(), None);
        assert!(matches!(yes_no("maybe"), Err(VocabularyError::UnknownYesNo(_))));
    }

    #[test]
    fn ages_are_capped() {
        assert_eq!(age_ceiling(92.5), 85.0);
        assert_eq!(age_ceiling(4.0), 4.0);
    }

    #[test]
    fn sentinel_detection() {
        assert!(is_prefer_not_to_say("Prefer not to say"));
        assert!(!is_prefer_not_to_say("unknown"));
        assert!(is_no_answer("  "));
    }
}
