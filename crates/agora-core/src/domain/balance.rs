//! Actor balance reconciliation.
//!
//! Each actor's balance lives in its own record plus a denormalized
//! public profile kept for cheap reads. The two copies are written as
//! separate, staggered operations — eventual, not atomic, consistency —
//! and the actor's in-memory state is mutated only after both remote
//! writes succeed, so a failed cycle leaves local and remote state
//! agreeing on the last confirmed balance.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::coordination::stagger::StaggeredScheduler;
use crate::coordination::writer::ConflictSafeWriter;
use crate::error::{Result, StoreError};
use crate::store::{DocRef, SetOptions};

/// Collection holding per-actor balance records.
const ACTORS_COLLECTION: &str = "actors";

/// Collection holding the denormalized public profiles.
const PROFILES_COLLECTION: &str = "actor_profiles";

/// An actor's private, in-memory copy of its own financial state.
///
/// Mutated only after the corresponding remote writes are confirmed.
#[derive(Debug, Clone)]
pub struct ActorState {
    /// The actor id (document id in both collections).
    pub id: String,
    /// Last confirmed balance.
    pub balance: f64,
    /// Running total of positive balance changes.
    pub total_earnings: f64,
    /// Running total of negative balance changes, as a positive number.
    pub total_losses: f64,
}

impl ActorState {
    /// Create local state for an actor with a starting balance.
    pub fn new(id: impl Into<String>, starting_balance: f64) -> Self {
        Self {
            id: id.into(),
            balance: starting_balance,
            total_earnings: 0.0,
            total_losses: 0.0,
        }
    }
}

/// An actor's balance record as stored at `actors/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Current balance.
    pub balance: f64,
    /// Running total of earnings.
    pub total_earnings: f64,
    /// Running total of losses.
    pub total_losses: f64,
    /// When the actor last changed its balance.
    pub last_active: DateTime<Utc>,
}

/// The denormalized public profile at `actor_profiles/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    /// The actor this profile mirrors.
    pub actor_id: String,
    /// Mirrored balance.
    pub balance: f64,
    /// Mirrored earnings total.
    pub total_earnings: f64,
    /// Mirrored losses total.
    pub total_losses: f64,
    /// When the mirror was last refreshed.
    pub updated_at: DateTime<Utc>,
}

/// Writes actor balances and their public mirrors.
#[derive(Debug, Clone)]
pub struct BalanceLedger {
    writer: ConflictSafeWriter,
    scheduler: StaggeredScheduler,
}

impl BalanceLedger {
    /// Create a ledger with the default 100 ms stagger between the record
    /// write and the profile mirror write.
    #[must_use]
    pub fn new(writer: ConflictSafeWriter) -> Self {
        Self {
            writer,
            scheduler: StaggeredScheduler::default(),
        }
    }

    /// Create a ledger with a custom scheduler.
    #[must_use]
    pub fn with_scheduler(writer: ConflictSafeWriter, scheduler: StaggeredScheduler) -> Self {
        Self { writer, scheduler }
    }

    fn actor_ref(actor_id: &str) -> DocRef {
        DocRef::new(ACTORS_COLLECTION, actor_id)
    }

    fn profile_ref(actor_id: &str) -> DocRef {
        DocRef::new(PROFILES_COLLECTION, actor_id)
    }

    /// Seed the remote records for a new actor from its local state.
    pub async fn register(&self, actor: &ActorState) -> Result<()> {
        let now = Utc::now();
        let record = BalanceRecord {
            balance: actor.balance,
            total_earnings: actor.total_earnings,
            total_losses: actor.total_losses,
            last_active: now,
        };
        let profile = ProfileRecord {
            actor_id: actor.id.clone(),
            balance: actor.balance,
            total_earnings: actor.total_earnings,
            total_losses: actor.total_losses,
            updated_at: now,
        };

        self.writer
            .safe_set(
                &Self::actor_ref(&actor.id),
                serde_json::to_value(&record)?,
                SetOptions::default(),
            )
            .await?;
        self.writer
            .safe_set(
                &Self::profile_ref(&actor.id),
                serde_json::to_value(&profile)?,
                SetOptions::merge(),
            )
            .await
    }

    /// Apply a balance change to an actor.
    ///
    /// Computes the prospective balance from the actor's last confirmed
    /// local value, then writes the actor record and the profile mirror as
    /// a staggered batch. Only when both writes succeed is the local state
    /// mutated; on any failure the local copy keeps the last confirmed
    /// values and the error propagates to fail this one action.
    pub async fn update_balance(&self, actor: &mut ActorState, delta: f64) -> Result<f64> {
        let now = Utc::now();
        let new_balance = actor.balance + delta;
        let (earned, lost) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        let new_earnings = actor.total_earnings + earned;
        let new_losses = actor.total_losses + lost;

        let record = BalanceRecord {
            balance: new_balance,
            total_earnings: new_earnings,
            total_losses: new_losses,
            last_active: now,
        };
        let profile = ProfileRecord {
            actor_id: actor.id.clone(),
            balance: new_balance,
            total_earnings: new_earnings,
            total_losses: new_losses,
            updated_at: now,
        };

        let actor_doc = Self::actor_ref(&actor.id);
        let profile_doc = Self::profile_ref(&actor.id);
        let record_fields = serde_json::to_value(&record).map_err(StoreError::from)?;
        let profile_value = serde_json::to_value(&profile).map_err(StoreError::from)?;

        let writer = &self.writer;
        self.scheduler
            .run(vec![
                async move { writer.safe_update(&actor_doc, record_fields).await }.boxed(),
                async move {
                    writer
                        .safe_set(&profile_doc, profile_value, SetOptions::merge())
                        .await
                }
                .boxed(),
            ])
            .await?;

        actor.balance = new_balance;
        actor.total_earnings = new_earnings;
        actor.total_losses = new_losses;
        Ok(new_balance)
    }

    /// Read an actor's stored balance record.
    pub async fn fetch(&self, actor_id: &str) -> Result<Option<BalanceRecord>> {
        match self.writer.store().get(&Self::actor_ref(actor_id)).await? {
            Some(found) => Ok(Some(
                serde_json::from_value(found.data).map_err(StoreError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Read an actor's public profile mirror.
    pub async fn fetch_profile(&self, actor_id: &str) -> Result<Option<ProfileRecord>> {
        match self.writer.store().get(&Self::profile_ref(actor_id)).await? {
            Some(found) => Ok(Some(
                serde_json::from_value(found.data).map_err(StoreError::from)?,
            )),
            None => Ok(None),
        }
    }
}
