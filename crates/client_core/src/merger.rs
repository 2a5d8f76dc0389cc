//! Reconciles the two backends' registration views into the state shown to the user.

use shared::domain::RegistrationStatus;

pub const REGISTERED_ELSEWHERE_MESSAGE: &str = "Registered on another device.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveState {
    pub is_registered: bool,
    pub info_message: Option<String>,
}

/// Rules are checked in order and the first match wins. Only the primary
/// backend can report "registered elsewhere"; the secondary status is not
/// looked at in that case.
pub fn merge_statuses(
    primary: RegistrationStatus,
    secondary: RegistrationStatus,
) -> EffectiveState {
    match (primary, secondary) {
        (RegistrationStatus::RegisteredElsewhere, _) => EffectiveState {
            is_registered: false,
            info_message: Some(REGISTERED_ELSEWHERE_MESSAGE.to_string()),
        },
        (RegistrationStatus::Registered, RegistrationStatus::Registered) => EffectiveState {
            is_registered: true,
            info_message: None,
        },
        _ => EffectiveState {
            is_registered: false,
            info_message: None,
        },
    }
}

#[cfg(test)]
#[path = "tests/merger_tests.rs"]
mod tests;
