//! Learner repository
//!
//! Candidate lookups for the matching engine. Learner onboarding is owned by
//! the platform; `insert` exists for seeding and tests.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QuerySelect, Set,
    sea_query::{Expr, Func},
};
use std::sync::Arc;
use uuid::Uuid;

use crate::matching::{CandidateQuery, LearnerDirectory};
use crate::models::learner::{self, Entity as Learner};

/// Upper bound on rows a single candidate query may return
const MAX_CANDIDATES: u64 = 200;

#[derive(Debug, Clone)]
pub struct LearnerRepository {
    pub db: Arc<DatabaseConnection>,
}

/// Fields for a new learner row
#[derive(Debug, Clone, Default)]
pub struct NewLearner {
    pub full_name: String,
    pub email: Option<String>,
    pub secondary_email: Option<String>,
    pub phone: Option<String>,
    pub registry_id: Option<String>,
    pub last_active_at: Option<DateTime<FixedOffset>>,
}

impl LearnerRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<learner::Model>, DbErr> {
        Learner::find_by_id(id).one(&*self.db).await
    }

    pub async fn insert(&self, new: NewLearner) -> Result<learner::Model, DbErr> {
        let model = learner::ActiveModel {
            id: Set(Uuid::new_v4()),
            full_name: Set(new.full_name),
            email: Set(new.email.map(|e| e.to_lowercase())),
            secondary_email: Set(new.secondary_email.map(|e| e.to_lowercase())),
            phone: Set(new.phone),
            registry_id: Set(new.registry_id),
            last_active_at: Set(new.last_active_at),
            created_at: Set(Utc::now().fixed_offset()),
        };
        model.insert(&*self.db).await
    }
}

#[async_trait]
impl LearnerDirectory for LearnerRepository {
    async fn find_candidates(
        &self,
        query: &CandidateQuery,
    ) -> anyhow::Result<Vec<learner::Model>> {
        let mut any = Condition::any();

        if let Some(email) = &query.email {
            any = any
                .add(learner::Column::Email.eq(email.as_str()))
                .add(learner::Column::SecondaryEmail.eq(email.as_str()));
        }
        if let Some(registry_id) = &query.registry_id {
            any = any.add(learner::Column::RegistryId.eq(registry_id.as_str()));
        }
        if let Some(phone) = query.phone.as_deref().filter(|p| !p.is_empty()) {
            // Stored numbers may carry a country code prefix.
            any = any.add(learner::Column::Phone.like(format!("%{phone}")));
        }
        for token in &query.name_tokens {
            any = any.add(
                Expr::expr(Func::lower(Expr::col(learner::Column::FullName)))
                    .like(format!("%{token}%")),
            );
        }

        if any.is_empty() {
            return Ok(Vec::new());
        }

        let learners = Learner::find()
            .filter(any)
            .limit(MAX_CANDIDATES)
            .all(&*self.db)
            .await?;
        Ok(learners)
    }
}
