use super::{is_no_answer, normalize, VocabResult, VocabularyError};

/// Normalized symptom term, in the camelCase form used by questionnaire answers.
pub fn symptom(raw: &str) -> VocabResult<Option<&'static str>> {
    let value = normalize(raw);
    let term = match value.as_str() {
        "fever" | "feverish" | "feeling feverish" | "feelingfeverish" => "feelingFeverish",
        "headache" | "headaches" => "headaches",
        "cough" => "cough",
        "chills" | "sweats" | "chills or sweats" | "chillsorsweats" => "chillsOrSweats",
        "sore throat" | "sorethroat" => "soreThroat",
        "nausea" | "vomiting" | "nausea or vomiting" | "nauseaorvomiting" => "nauseaOrVomiting",
        "runny nose" | "stuffy nose" | "runny or stuffy nose" | "congestion"
        | "runnyorstuffynose" => "runnyOrStuffyNose",
        "fatigue" | "tired" | "feeling more tired than usual" => "fatigue",
        "muscle aches" | "body aches" | "muscle or body aches" | "myalgia"
        | "muscleorbodyaches" => "muscleOrBodyAches",
        "diarrhea" => "diarrhea",
        "ear pain" | "ear discharge" | "ear pain or discharge" | "earpainordischarge" => {
            "earPainOrDischarge"
        }
        "rash" => "rash",
        "trouble breathing" | "shortness of breath" | "increased trouble breathing"
        | "increasedtroublebreathing" => "increasedTroubleBreathing",
        "loss of smell" | "loss of taste" | "loss of smell or taste" | "anosmia"
        | "lossofsmellortaste" => "lossOfSmellOrTaste",
        "eye pain" | "eye irritation" | "eyepain" => "eyePain",
        "none" | "no symptoms" => return Ok(None),
        _ if is_no_answer(&value) => return Ok(None),
        _ => return Err(VocabularyError::UnknownSymptom(raw.trim().to_string())),
    };
    Ok(Some(term))
}

/// Vaccination status as `yes`, `no` or `unknown`.
///
/// "Don't know" is an answer here, unlike a refusal which maps to absence.
pub fn vaccine_status(raw: &str) -> VocabResult<Option<&'static str>> {
    let value = normalize(raw);
    let term = match value.as_str() {
        "yes" | "y" | "true" | "1" | "vaccinated" | "received" => "yes",
        "no" | "n" | "false" | "0" | "not vaccinated" | "not received" => "no",
        "unknown" | "dont know" | "dont_know" | "don't know" | "do not know" | "not sure" | "unsure" => {
            "unknown"
        }
        _ if is_no_answer(&value) => return Ok(None),
        _ => return Err(VocabularyError::UnknownVaccineStatus(raw.trim().to_string())),
    };
    Ok(Some(term))
}

/// FHIR `discharge-disposition` code from free text or a UB-04 status code.
pub fn discharge_disposition(raw: &str) -> VocabResult<Option<&'static str>> {
    let value = normalize(raw);
    let code = match value.as_str() {
        "home" | "discharged to home" | "home or self care" | "01" => "home",
        "home health" | "home with home health" | "06" => "alt-home",
        "transfer to hospital" | "short term hospital" | "02" => "other-hcf",
        "hospice" | "50" | "51" => "hosp",
        "long term care" | "63" => "long",
        "left against medical advice" | "ama" | "07" => "aadvice",
        "expired" | "died" | "20" => "exp",
        "psychiatric" | "psychiatric hospital" | "65" => "psy",
        "rehab" | "rehabilitation" | "62" => "rehab",
        "skilled nursing facility" | "snf" | "03" => "snf",
        "other" => "oth",
        _ if is_no_answer(&value) => return Ok(None),
        _ => {
            return Err(VocabularyError::UnknownDischargeDisposition(
                raw.trim().to_string(),
            ))
        }
    };
    Ok(Some(code))
}

/// Validate and canonicalize an ICD-10-CM code (`J10.1`, `U071`).
pub fn icd10(raw: &str) -> VocabResult<Option<String>> {
    let value = raw.trim().to_uppercase();
    if is_no_answer(&value) {
        return Ok(None);
    }

    let compact: String = value.chars().filter(|c| *c != '.').collect();
    let mut chars = compact.chars();
    let valid = compact.len() >= 3
        && compact.len() <= 7
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.next().is_some_and(|c| c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_alphanumeric())
        && value.matches('.').count() <= 1;

    if !valid {
        return Err(VocabularyError::UnknownIcd10(raw.trim().to_string()));
    }

    if compact.len() > 3 {
        Ok(Some(format!("{}.{}", &compact[..3], &compact[3..])))
    } else {
        Ok(Some(compact))
    }
}
