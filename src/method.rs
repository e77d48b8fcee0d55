use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The kind of subject being verified. Individuals, businesses, and
/// organizations share one orchestrator, parameterized by this tag — see
/// the "repeated per-user-type workflow wrappers" redesign note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Individual,
    Business,
    Organization,
}

/// Closed set of recognized verification methods.
///
/// All methods are optional; none are hard requirements. They differ only
/// in which subject kinds they apply to and how many points they award.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    // Universal
    Email,
    Phone,

    // Individual
    InPersonTwoParty,
    InPersonSingle,
    GovernmentId,
    Biometric,
    PersonalReference,
    CommunityAttestation,
    PlatformHistory,
    TransactionHistory,

    // Business
    BusinessLicense,
    TaxIdBusiness,
    BusinessAddress,
    OwnerVerification,
    BusinessInsurance,
    ProfessionalLicense,
    BusinessReferences,
    CommunityEndorsement,

    // Organization
    NonprofitStatus,
    TaxIdNonprofit,
    OrganizationBylaws,
    BoardVerification,
    MissionAlignment,
    OrgReferences,

    // Enhanced, any subject kind
    NotaryVerification,
}

/// Static metadata for one method variant.
#[derive(Debug, Clone, Copy)]
pub struct MethodMeta {
    pub base_points: u32,
    pub max_multiplier: u32,
    pub decay_days: u32,
    pub needs_human_review: bool,
}

impl Method {
    /// All variants, for iteration (scoring, catalogue listing).
    pub const ALL: &'static [Method] = &[
        Method::Email,
        Method::Phone,
        Method::InPersonTwoParty,
        Method::InPersonSingle,
        Method::GovernmentId,
        Method::Biometric,
        Method::PersonalReference,
        Method::CommunityAttestation,
        Method::PlatformHistory,
        Method::TransactionHistory,
        Method::BusinessLicense,
        Method::TaxIdBusiness,
        Method::BusinessAddress,
        Method::OwnerVerification,
        Method::BusinessInsurance,
        Method::ProfessionalLicense,
        Method::BusinessReferences,
        Method::CommunityEndorsement,
        Method::NonprofitStatus,
        Method::TaxIdNonprofit,
        Method::OrganizationBylaws,
        Method::BoardVerification,
        Method::MissionAlignment,
        Method::OrgReferences,
        Method::NotaryVerification,
    ];

    /// Point value and decay/multiplier metadata for this method.
    ///
    /// Invariant: `base_points * max_multiplier` never exceeds the
    /// `Complete` threshold (600) for any single method.
    pub fn meta(self) -> MethodMeta {
        use Method::*;
        match self {
            Email => MethodMeta { base_points: 30, max_multiplier: 1, decay_days: 365, needs_human_review: false },
            Phone => MethodMeta { base_points: 30, max_multiplier: 1, decay_days: 365, needs_human_review: false },

            InPersonTwoParty => MethodMeta { base_points: 150, max_multiplier: 1, decay_days: 730, needs_human_review: false },
            InPersonSingle => MethodMeta { base_points: 75, max_multiplier: 1, decay_days: 730, needs_human_review: false },
            GovernmentId => MethodMeta { base_points: 100, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            Biometric => MethodMeta { base_points: 80, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            PersonalReference => MethodMeta { base_points: 50, max_multiplier: 3, decay_days: 0, needs_human_review: false },
            CommunityAttestation => MethodMeta { base_points: 40, max_multiplier: 3, decay_days: 0, needs_human_review: false },
            PlatformHistory => MethodMeta { base_points: 30, max_multiplier: 1, decay_days: 0, needs_human_review: false },
            TransactionHistory => MethodMeta { base_points: 40, max_multiplier: 1, decay_days: 0, needs_human_review: false },

            BusinessLicense => MethodMeta { base_points: 120, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            TaxIdBusiness => MethodMeta { base_points: 120, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            BusinessAddress => MethodMeta { base_points: 80, max_multiplier: 1, decay_days: 1825, needs_human_review: false },
            OwnerVerification => MethodMeta { base_points: 100, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            BusinessInsurance => MethodMeta { base_points: 60, max_multiplier: 1, decay_days: 365, needs_human_review: false },
            ProfessionalLicense => MethodMeta { base_points: 80, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            BusinessReferences => MethodMeta { base_points: 50, max_multiplier: 3, decay_days: 0, needs_human_review: false },
            CommunityEndorsement => MethodMeta { base_points: 60, max_multiplier: 1, decay_days: 0, needs_human_review: false },

            NonprofitStatus => MethodMeta { base_points: 120, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            TaxIdNonprofit => MethodMeta { base_points: 120, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            OrganizationBylaws => MethodMeta { base_points: 80, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            BoardVerification => MethodMeta { base_points: 100, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
            MissionAlignment => MethodMeta { base_points: 80, max_multiplier: 1, decay_days: 0, needs_human_review: true },
            OrgReferences => MethodMeta { base_points: 50, max_multiplier: 3, decay_days: 0, needs_human_review: false },

            NotaryVerification => MethodMeta { base_points: 90, max_multiplier: 1, decay_days: 1825, needs_human_review: true },
        }
    }

    /// Subject kinds this method applies to.
    pub fn applicable_kinds(self) -> HashSet<SubjectKind> {
        use Method::*;
        use SubjectKind::*;
        let kinds: &[SubjectKind] = match self {
            Email | Phone | NotaryVerification => &[Individual, Business, Organization],

            InPersonTwoParty
            | InPersonSingle
            | GovernmentId
            | Biometric
            | PersonalReference
            | CommunityAttestation
            | PlatformHistory
            | TransactionHistory => &[Individual],

            BusinessLicense
            | TaxIdBusiness
            | BusinessAddress
            | OwnerVerification
            | BusinessInsurance
            | ProfessionalLicense
            | BusinessReferences
            | CommunityEndorsement => &[Business],

            NonprofitStatus
            | TaxIdNonprofit
            | OrganizationBylaws
            | BoardVerification
            | MissionAlignment
            | OrgReferences => &[Organization],
        };
        kinds.iter().copied().collect()
    }

    /// Whether this method spawns its own child workflow, as opposed to
    /// being awarded passively by the orchestrator from an external signal
    /// (platform/transaction history).
    pub fn is_passive(self) -> bool {
        matches!(self, Method::PlatformHistory | Method::TransactionHistory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_single_method_clears_complete_alone() {
        for m in Method::ALL {
            let meta = m.meta();
            assert!(
                meta.base_points * meta.max_multiplier < 600,
                "{:?} alone would clear Complete",
                m
            );
        }
    }

    #[test]
    fn two_party_applies_only_to_individuals() {
        let kinds = Method::InPersonTwoParty.applicable_kinds();
        assert!(kinds.contains(&SubjectKind::Individual));
        assert!(!kinds.contains(&SubjectKind::Business));
        assert!(!kinds.contains(&SubjectKind::Organization));
    }
}
