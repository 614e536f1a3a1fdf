use super::{is_no_answer, normalize, VocabResult, VocabularyError};

/// Race, as one of the OMB categories used by the warehouse.
pub fn race(raw: &str) -> VocabResult<Option<&'static str>> {
    let value = normalize(raw);
    let term = match value.as_str() {
        "american indian or alaska native"
        | "american indian"
        | "alaska native"
        | "aian"
        | "amerind"
        | "americanindianoralaskanative" => "americanIndianOrAlaskaNative",
        "asian" | "asian american" => "asian",
        "black" | "black or african american" | "african american" | "blackorafricanamerican" => {
            "blackOrAfricanAmerican"
        }
        "native hawaiian or other pacific islander"
        | "native hawaiian"
        | "pacific islander"
        | "nhopi"
        | "nativehi"
        | "nativehawaiian" => "nativeHawaiian",
        "white" | "caucasian" => "white",
        "other" | "other race" | "multiple races" | "multiracial" => "other",
        _ if is_no_answer(&value) => return Ok(None),
        "dont know" | "dont_know" | "don't know" => return Ok(None),
        _ => return Err(VocabularyError::UnknownRace(raw.trim().to_string())),
    };
    Ok(Some(term))
}

/// Hispanic or Latino ethnicity as a boolean.
pub fn hispanic_latino(raw: &str) -> VocabResult<Option<bool>> {
    let value = normalize(raw);
    match value.as_str() {
        "hispanic or latino" | "hispanic" | "latino" | "latinx" | "hispanic/latino"
        | "hispanicorlatino" | "yes" => Ok(Some(true)),
        "not hispanic or latino" | "not hispanic" | "non-hispanic" | "non hispanic"
        | "nothispanicorlatino" | "no" => Ok(Some(false)),
        "dont know" | "dont_know" | "don't know" => Ok(None),
        _ if is_no_answer(&value) => Ok(None),
        _ => Err(VocabularyError::UnknownEthnicity(raw.trim().to_string())),
    }
}

/// Administrative sex as FHIR `Patient.gender`.
pub fn sex(raw: &str) -> VocabResult<Option<&'static str>> {
    let value = normalize(raw);
    let term = match value.as_str() {
        "male" | "m" => "male",
        "female" | "f" => "female",
        "other" | "indeterminate" | "intersex" | "non-binary" | "nonbinary" => "other",
        _ if is_no_answer(&value) => return Ok(None),
        "u" => return Ok(None),
        _ => return Err(VocabularyError::UnknownSex(raw.trim().to_string())),
    };
    Ok(Some(term))
}

pub fn insurance(raw: &str) -> VocabResult<Option<&'static str>> {
    let value = normalize(raw);
    let term = match value.as_str() {
        "commercial" | "private" | "private insurance" | "employer" | "privateinsurance" => {
            "privateInsurance"
        }
        "medicaid" | "medicare" | "apple health" | "tricare" | "government" | "va" => {
            "government"
        }
        "none" | "uninsured" | "self-pay" | "self pay" => "none",
        "other" => "other",
        "dont know" | "dont_know" | "don't know" => return Ok(None),
        _ if is_no_answer(&value) => return Ok(None),
        _ => return Err(VocabularyError::UnknownInsurance(raw.trim().to_string())),
    };
    Ok(Some(term))
}
