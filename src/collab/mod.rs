//! Collaborator interfaces.
//!
//! The CRUD systems around the orchestrator (persona management, user
//! accounts, billing, call records) live behind these narrow async
//! traits. The in-memory implementations back tests and single-node
//! deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::config::pricing::Price;
use crate::errors::{SessionError, SessionResult};
use crate::session::usage::CostBreakdown;

/// Persona configuration snapshot taken at call start.
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: String,
    pub system_prompt: String,
    pub voice_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_duration_minutes: u32,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            id: String::new(),
            system_prompt: String::new(),
            voice_id: String::new(),
            max_tokens: 256,
            temperature: 0.7,
            max_duration_minutes: 10,
        }
    }
}

/// Caller-persona relationship context.
#[derive(Debug, Clone, Default)]
pub struct Relationship {
    pub user_id: String,
    pub persona_id: String,
    /// Free-text summary of prior interactions
    pub summary: Option<String>,
    pub call_count: u32,
}

/// Emitted to collaborators once a call has finalized.
#[derive(Debug, Clone)]
pub struct SessionCompletion {
    pub call_id: String,
    pub duration_seconds: f64,
    pub cost: CostBreakdown,
    pub transcript: String,
}

#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn get(&self, id: &str) -> SessionResult<Option<Persona>>;
}

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    async fn get_or_create(&self, user_id: &str, persona_id: &str) -> SessionResult<Relationship>;
}

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Facts read at call start and layered into the prompt.
    async fn get(&self, user_id: &str, persona_id: &str) -> SessionResult<Vec<String>>;
    /// Record newly learned caller facts. The live session only reads;
    /// writes come from the transcript-distillation pipeline that runs
    /// on completed call records.
    async fn append(
        &self,
        user_id: &str,
        persona_id: &str,
        facts: Vec<String>,
    ) -> SessionResult<()>;
}

#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn mark_completed(&self, completion: &SessionCompletion) -> SessionResult<()>;
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Deduct call minutes from the user's balance.
    async fn deduct(&self, user_id: &str, minutes: f64) -> SessionResult<()>;
}

#[async_trait]
pub trait PricingSource: Send + Sync {
    /// Current unit prices keyed "service:operation".
    async fn current_prices(&self) -> SessionResult<HashMap<String, Price>>;
}

/// Bundle of collaborator handles injected into each call session.
#[derive(Clone)]
pub struct Collaborators {
    pub personas: Arc<dyn PersonaStore>,
    pub relationships: Arc<dyn RelationshipStore>,
    pub facts: Arc<dyn FactStore>,
    pub call_records: Arc<dyn CallRecordStore>,
    pub credits: Arc<dyn CreditLedger>,
    pub pricing: Arc<dyn PricingSource>,
}

impl Collaborators {
    /// All-in-memory bundle.
    pub fn in_memory() -> Self {
        Self {
            personas: Arc::new(InMemoryPersonaStore::default()),
            relationships: Arc::new(InMemoryRelationshipStore::default()),
            facts: Arc::new(InMemoryFactStore::default()),
            call_records: Arc::new(InMemoryCallRecordStore::default()),
            credits: Arc::new(InMemoryCreditLedger::default()),
            pricing: Arc::new(StaticPricingSource::default()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryPersonaStore {
    personas: RwLock<HashMap<String, Persona>>,
}

impl InMemoryPersonaStore {
    pub fn insert(&self, persona: Persona) {
        self.personas.write().insert(persona.id.clone(), persona);
    }
}

#[async_trait]
impl PersonaStore for InMemoryPersonaStore {
    async fn get(&self, id: &str) -> SessionResult<Option<Persona>> {
        Ok(self.personas.read().get(id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryRelationshipStore {
    relationships: RwLock<HashMap<(String, String), Relationship>>,
}

#[async_trait]
impl RelationshipStore for InMemoryRelationshipStore {
    async fn get_or_create(&self, user_id: &str, persona_id: &str) -> SessionResult<Relationship> {
        let key = (user_id.to_string(), persona_id.to_string());
        let mut map = self.relationships.write();
        let relationship = map.entry(key).or_insert_with(|| Relationship {
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            ..Default::default()
        });
        relationship.call_count += 1;
        Ok(relationship.clone())
    }
}

#[derive(Default)]
pub struct InMemoryFactStore {
    facts: RwLock<HashMap<(String, String), Vec<String>>>,
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn get(&self, user_id: &str, persona_id: &str) -> SessionResult<Vec<String>> {
        let key = (user_id.to_string(), persona_id.to_string());
        Ok(self.facts.read().get(&key).cloned().unwrap_or_default())
    }

    async fn append(
        &self,
        user_id: &str,
        persona_id: &str,
        facts: Vec<String>,
    ) -> SessionResult<()> {
        let key = (user_id.to_string(), persona_id.to_string());
        self.facts.write().entry(key).or_default().extend(facts);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCallRecordStore {
    completed: RwLock<Vec<SessionCompletion>>,
}

impl InMemoryCallRecordStore {
    pub fn completed(&self) -> Vec<SessionCompletion> {
        self.completed.read().clone()
    }
}

#[async_trait]
impl CallRecordStore for InMemoryCallRecordStore {
    async fn mark_completed(&self, completion: &SessionCompletion) -> SessionResult<()> {
        info!(
            call_id = %completion.call_id,
            duration_seconds = completion.duration_seconds,
            "Call record completed"
        );
        self.completed.write().push(completion.clone());
        Ok(())
    }
}

/// Ledger over in-memory minute balances. Unknown users are rejected.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    balances: RwLock<HashMap<String, f64>>,
}

impl InMemoryCreditLedger {
    pub fn credit(&self, user_id: &str, minutes: f64) {
        *self.balances.write().entry(user_id.to_string()).or_insert(0.0) += minutes;
    }

    pub fn balance(&self, user_id: &str) -> Option<f64> {
        self.balances.read().get(user_id).copied()
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn deduct(&self, user_id: &str, minutes: f64) -> SessionResult<()> {
        let mut balances = self.balances.write();
        match balances.get_mut(user_id) {
            Some(balance) => {
                *balance -= minutes;
                Ok(())
            }
            None => Err(SessionError::LedgerWrite(format!(
                "no balance for user {user_id}"
            ))),
        }
    }
}

/// Pricing source with a fixed price map; empty by default, which
/// leaves the static table defaults in effect.
#[derive(Default)]
pub struct StaticPricingSource {
    prices: RwLock<HashMap<String, Price>>,
}

impl StaticPricingSource {
    pub fn set(&self, key: impl Into<String>, price: Price) {
        self.prices.write().insert(key.into(), price);
    }
}

#[async_trait]
impl PricingSource for StaticPricingSource {
    async fn current_prices(&self) -> SessionResult<HashMap<String, Price>> {
        Ok(self.prices.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relationship_call_count_increments() {
        let store = InMemoryRelationshipStore::default();
        let first = store.get_or_create("user-1", "persona-1").await.unwrap();
        assert_eq!(first.call_count, 1);
        let second = store.get_or_create("user-1", "persona-1").await.unwrap();
        assert_eq!(second.call_count, 2);
    }

    #[tokio::test]
    async fn test_fact_store_appends() {
        let store = InMemoryFactStore::default();
        store
            .append("user-1", "persona-1", vec!["likes jazz".to_string()])
            .await
            .unwrap();
        store
            .append("user-1", "persona-1", vec!["lives in Lyon".to_string()])
            .await
            .unwrap();
        let facts = store.get("user-1", "persona-1").await.unwrap();
        assert_eq!(facts, vec!["likes jazz", "lives in Lyon"]);
    }

    #[tokio::test]
    async fn test_credit_ledger_deducts_known_users_only() {
        let ledger = InMemoryCreditLedger::default();
        ledger.credit("user-1", 10.0);
        ledger.deduct("user-1", 2.5).await.unwrap();
        assert_eq!(ledger.balance("user-1"), Some(7.5));
        assert!(ledger.deduct("ghost", 1.0).await.is_err());
    }
}
