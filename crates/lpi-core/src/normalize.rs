//! Canonical natural keys for process numbers and party documents.

use crate::PersonType;

/// Shortest digit run accepted as a party document (a CPF has 11 digits).
pub const MIN_DOCUMENT_DIGITS: usize = 11;

/// Digits of a CNPJ; documents this long or longer are legal entities.
pub const CNPJ_DIGITS: usize = 14;

const CNJ_DIGITS: usize = 20;

fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Strips every non-digit character from a process number.
///
/// Malformed or partial numbers are kept as a best-effort key rather than
/// rejected; an empty result means the input carried no digits at all.
pub fn normalize_process_number(raw: &str) -> String {
    digits_only(raw)
}

/// Canonical CPF/CNPJ digits, or `None` when fewer than 11 digits remain.
pub fn normalize_document(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    if digits.len() < MIN_DOCUMENT_DIGITS {
        None
    } else {
        Some(digits)
    }
}

pub fn person_type_for(document: &str) -> PersonType {
    if document.len() >= CNPJ_DIGITS {
        PersonType::Legal
    } else {
        PersonType::Individual
    }
}

/// Renders a canonical 20-digit number as `NNNNNNN-DD.AAAA.J.TR.OOOO`.
pub fn format_cnj(canonical: &str) -> Option<String> {
    if canonical.len() != CNJ_DIGITS || !canonical.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!(
        "{}-{}.{}.{}.{}.{}",
        &canonical[0..7],
        &canonical[7..9],
        &canonical[9..13],
        &canonical[13..14],
        &canonical[14..16],
        &canonical[16..20]
    ))
}
