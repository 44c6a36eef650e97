//! # Matching Engine
//!
//! Maps a normalized external credential onto internal learners. Each learner
//! returned by the [`LearnerDirectory`] is scored by its strongest identity
//! signal, and the best score is turned into a [`MatchDecision`] using the
//! configured confidence band.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::RawExternalCredential;
use crate::config::{MatchingConfig, TieBreakPolicy};
use crate::models::learner;

/// Fuzzy name similarity below this is not considered a candidate at all.
const MIN_NAME_SIMILARITY: f64 = 0.5;

/// Scores closer than this are treated as equal when detecting ties.
const TIE_EPSILON: f64 = 1e-9;

/// Identity fields used to look up candidate learners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQuery {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub registry_id: Option<String>,
    /// Normalized name tokens; learners whose name contains any of them are returned
    pub name_tokens: Vec<String>,
}

impl CandidateQuery {
    pub fn from_credential(raw: &RawExternalCredential) -> Self {
        let name = normalize_name(&raw.candidate_name);
        Self {
            email: raw.candidate_email.as_deref().map(normalize_email),
            phone: raw.candidate_phone.as_deref().map(normalize_phone),
            registry_id: raw.candidate_registry_id.clone(),
            name_tokens: name
                .split(' ')
                .filter(|token| token.len() >= 2)
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.phone.is_none()
            && self.registry_id.is_none()
            && self.name_tokens.is_empty()
    }
}

/// Source of internal learner identities.
#[async_trait]
pub trait LearnerDirectory: Send + Sync {
    /// Returns every learner sharing at least one identity field with the query.
    async fn find_candidates(&self, query: &CandidateQuery) -> anyhow::Result<Vec<learner::Model>>;
}

/// Which identity signal produced a candidate's confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchSignal {
    PrimaryEmail,
    SecondaryEmail,
    Phone,
    RegistryId,
    NameAndEmailDomain,
    FuzzyName,
}

/// A learner scored against a credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Candidate {
    pub learner_id: Uuid,
    pub confidence: f64,
    pub signal: MatchSignal,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_active_at: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    AutoAccept,
    PendingReview,
    Reject,
}

/// Outcome of matching one credential
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub decision: MatchDecision,
    /// Best confidence found, 0.0 when there were no candidates
    pub confidence: f64,
    /// Learner chosen for auto-accept
    pub learner_id: Option<Uuid>,
    /// All candidates, best first
    pub candidates: Vec<Candidate>,
    /// Number of candidates sharing the top confidence
    pub tied: usize,
}

/// Applies the confidence band: at or above `threshold_high` accepts, at or
/// above `threshold_low` queues for review, anything else rejects.
pub fn decide(confidence: f64, config: &MatchingConfig) -> MatchDecision {
    if confidence >= config.threshold_high {
        MatchDecision::AutoAccept
    } else if confidence >= config.threshold_low {
        MatchDecision::PendingReview
    } else {
        MatchDecision::Reject
    }
}

pub struct MatchingEngine {
    directory: Arc<dyn LearnerDirectory>,
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(directory: Arc<dyn LearnerDirectory>, config: MatchingConfig) -> Self {
        Self { directory, config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub async fn evaluate(&self, raw: &RawExternalCredential) -> anyhow::Result<MatchOutcome> {
        let query = CandidateQuery::from_credential(raw);
        let learners = if query.is_empty() {
            Vec::new()
        } else {
            self.directory.find_candidates(&query).await?
        };

        let candidates = score_learners(raw, &learners, &self.config);
        let outcome = select(candidates, &self.config);

        tracing::debug!(
            provider_id = %raw.provider_id,
            provider_credential_id = %raw.provider_credential_id,
            confidence = outcome.confidence,
            candidates = outcome.candidates.len(),
            tied = outcome.tied,
            decision = ?outcome.decision,
            "Matched credential against learners"
        );

        Ok(outcome)
    }
}

/// Scores each learner by its strongest signal and orders them best first.
/// Ties on confidence are ordered by most recent activity.
pub fn score_learners(
    raw: &RawExternalCredential,
    learners: &[learner::Model],
    config: &MatchingConfig,
) -> Vec<Candidate> {
    let email = raw.candidate_email.as_deref().map(normalize_email);
    let phone = raw.candidate_phone.as_deref().map(normalize_phone);
    let name = normalize_name(&raw.candidate_name);
    let domain = email.as_deref().and_then(email_domain);

    let mut candidates: Vec<Candidate> = learners
        .iter()
        .filter_map(|learner| {
            let mut signals: Vec<(f64, MatchSignal)> = Vec::new();

            let primary = learner.email.as_deref().map(normalize_email);
            if email.is_some() && primary == email {
                signals.push((1.0, MatchSignal::PrimaryEmail));
            }
            if email.is_some() && learner.secondary_email.as_deref().map(normalize_email) == email
            {
                signals.push((config.secondary_email_confidence, MatchSignal::SecondaryEmail));
            }
            if phone.is_some() && learner.phone.as_deref().map(normalize_phone) == phone {
                signals.push((config.phone_confidence, MatchSignal::Phone));
            }
            if raw.candidate_registry_id.is_some()
                && learner.registry_id == raw.candidate_registry_id
            {
                signals.push((config.registry_id_confidence, MatchSignal::RegistryId));
            }

            let learner_name = normalize_name(&learner.full_name);
            if !name.is_empty() && learner_name == name {
                let learner_domain = primary.as_deref().and_then(email_domain);
                if domain.is_some() && learner_domain == domain {
                    signals.push((config.name_domain_confidence, MatchSignal::NameAndEmailDomain));
                }
            }

            if !name.is_empty() && !learner_name.is_empty() {
                let similarity = normalized_levenshtein(&name, &learner_name);
                if similarity >= MIN_NAME_SIMILARITY {
                    signals.push((similarity * config.name_only_weight, MatchSignal::FuzzyName));
                }
            }

            signals
                .into_iter()
                .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
                .map(|(confidence, signal)| Candidate {
                    learner_id: learner.id,
                    confidence: confidence.clamp(0.0, 1.0),
                    signal,
                    last_active_at: learner.last_active_at,
                })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_active_at.cmp(&a.last_active_at))
            .then_with(|| a.learner_id.cmp(&b.learner_id))
    });
    candidates
}

/// Turns ordered candidates into a decision, applying the tie-break policy
/// when several learners share the top confidence.
pub fn select(candidates: Vec<Candidate>, config: &MatchingConfig) -> MatchOutcome {
    let Some(top) = candidates.first() else {
        return MatchOutcome {
            decision: MatchDecision::Reject,
            confidence: 0.0,
            learner_id: None,
            candidates,
            tied: 0,
        };
    };

    let confidence = top.confidence;
    let tied = candidates
        .iter()
        .take_while(|c| (c.confidence - confidence).abs() < TIE_EPSILON)
        .count();

    let mut decision = decide(confidence, config);
    if decision == MatchDecision::AutoAccept
        && tied > 1
        && config.tie_break == TieBreakPolicy::ManualReview
    {
        decision = MatchDecision::PendingReview;
    }

    // Candidates are already ordered by recency within equal confidence.
    let learner_id = (decision == MatchDecision::AutoAccept).then_some(top.learner_id);

    MatchOutcome {
        decision,
        confidence,
        learner_id,
        candidates,
        tied,
    }
}

/// Lowercase letters and digits separated by single spaces.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Keeps digits only, retaining the last ten so `+91 98765 43210` and
/// `9876543210` compare equal.
pub fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    let skip = digits.len().saturating_sub(10);
    digits[skip..].to_string()
}

fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn raw(name: &str, email: Option<&str>) -> RawExternalCredential {
        RawExternalCredential {
            provider_id: "nsdc".to_string(),
            provider_credential_id: "C-1".to_string(),
            issuer_registry_id: None,
            candidate_name: name.to_string(),
            candidate_email: email.map(str::to_string),
            candidate_phone: None,
            candidate_registry_id: None,
            title: "Retail Sales Associate".to_string(),
            code: None,
            issue_date: None,
            sector: None,
            nsqf_level: None,
            training_hours_max: None,
            awarding_bodies: Vec::new(),
            certificate_url: None,
            raw_payload: json!({}),
            signature: None,
            verification_method: "nsdc_api".to_string(),
            signature_verified: false,
        }
    }

    fn learner(name: &str, email: Option<&str>, active_day: Option<u32>) -> learner::Model {
        learner::Model {
            id: Uuid::new_v4(),
            full_name: name.to_string(),
            email: email.map(str::to_string),
            secondary_email: None,
            phone: None,
            registry_id: None,
            last_active_at: active_day.map(|day| {
                Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0)
                    .unwrap()
                    .fixed_offset()
            }),
            created_at: Utc::now().fixed_offset(),
        }
    }

    fn config(high: f64, low: f64) -> MatchingConfig {
        MatchingConfig {
            threshold_high: high,
            threshold_low: low,
            ..MatchingConfig::default()
        }
    }

    #[test]
    fn decide_applies_confidence_band() {
        let cfg = config(0.9, 0.4);
        assert_eq!(decide(0.95, &cfg), MatchDecision::AutoAccept);
        assert_eq!(decide(0.9, &cfg), MatchDecision::AutoAccept);
        assert_eq!(decide(0.5, &cfg), MatchDecision::PendingReview);
        assert_eq!(decide(0.4, &cfg), MatchDecision::PendingReview);
        assert_eq!(decide(0.1, &cfg), MatchDecision::Reject);
    }

    #[test]
    fn primary_email_beats_fuzzy_name() {
        let cfg = MatchingConfig::default();
        let exact = learner("Someone Else", Some("asha@example.in"), None);
        let namesake = learner("Asha Verma", Some("asha.v@other.in"), None);

        let candidates = score_learners(
            &raw("Asha Verma", Some("ASHA@example.in")),
            &[namesake.clone(), exact.clone()],
            &cfg,
        );

        assert_eq!(candidates[0].learner_id, exact.id);
        assert_eq!(candidates[0].signal, MatchSignal::PrimaryEmail);
        assert_eq!(candidates[0].confidence, 1.0);
        assert_eq!(candidates[1].learner_id, namesake.id);
        assert_eq!(candidates[1].signal, MatchSignal::FuzzyName);
    }

    #[test]
    fn same_name_and_domain_scores_mid_band() {
        let cfg = MatchingConfig::default();
        let candidate = learner("Asha  Verma", Some("averma@example.in"), None);

        let candidates = score_learners(&raw("asha verma", Some("asha@example.in")), &[candidate], &cfg);

        assert_eq!(candidates[0].signal, MatchSignal::NameAndEmailDomain);
        assert_eq!(candidates[0].confidence, cfg.name_domain_confidence);
    }

    #[test]
    fn dissimilar_names_are_not_candidates() {
        let cfg = MatchingConfig::default();
        let candidates = score_learners(
            &raw("Asha Verma", None),
            &[learner("Zubin Mehta", None, None)],
            &cfg,
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn tie_break_prefers_most_recently_active_learner() {
        // Policy choice: equal confidence resolves to the latest `last_active_at`.
        let cfg = config(0.9, 0.4);
        let older = learner("A", Some("asha@example.in"), Some(1));
        let newer = learner("B", Some("asha@example.in"), Some(20));

        let outcome = select(
            score_learners(&raw("Asha", Some("asha@example.in")), &[older, newer.clone()], &cfg),
            &cfg,
        );

        assert_eq!(outcome.decision, MatchDecision::AutoAccept);
        assert_eq!(outcome.tied, 2);
        assert_eq!(outcome.learner_id, Some(newer.id));
    }

    #[test]
    fn manual_review_policy_queues_ties() {
        let cfg = MatchingConfig {
            tie_break: TieBreakPolicy::ManualReview,
            ..config(0.9, 0.4)
        };
        let a = learner("A", Some("asha@example.in"), Some(1));
        let b = learner("B", Some("asha@example.in"), Some(20));

        let outcome = select(
            score_learners(&raw("Asha", Some("asha@example.in")), &[a, b], &cfg),
            &cfg,
        );

        assert_eq!(outcome.decision, MatchDecision::PendingReview);
        assert_eq!(outcome.learner_id, None);
    }

    #[test]
    fn no_candidates_rejects_with_zero_confidence() {
        let outcome = select(Vec::new(), &MatchingConfig::default());
        assert_eq!(outcome.decision, MatchDecision::Reject);
        assert_eq!(outcome.confidence, 0.0);
    }

    #[test]
    fn normalizers() {
        assert_eq!(normalize_name("  ASHA   K. Verma "), "asha k verma");
        assert_eq!(normalize_phone("+91 98765-43210"), "9876543210");
        assert_eq!(normalize_email(" A@B.IN "), "a@b.in");
    }
}
