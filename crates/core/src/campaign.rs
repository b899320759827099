//! Campaign entity: groups work items and sets the batch cadence.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

/// Batch cadence: how often a batch goes out, how large it is, and how far
/// apart the individual sends within a batch are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSchedule {
    pub batch_interval_secs: u64,
    pub batch_size: u32,
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
    pub last_batch_at: Option<DateTime<Utc>>,
}

impl Default for CampaignSchedule {
    fn default() -> Self {
        Self {
            batch_interval_secs: 13 * 3600,
            batch_size: 10,
            delay_min_secs: 17,
            delay_max_secs: 23,
            last_batch_at: None,
        }
    }
}

impl CampaignSchedule {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn can_send_batch(&self, now: DateTime<Utc>) -> bool {
        match self.last_batch_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.batch_interval_secs as i64,
        }
    }

    pub fn record_batch_sent(&mut self, now: DateTime<Utc>) {
        self.last_batch_at = Some(now);
    }

    /// Random spacing between two sends of the same batch.
    pub fn pick_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let (lo, hi) = if self.delay_min_secs <= self.delay_max_secs {
            (self.delay_min_secs, self.delay_max_secs)
        } else {
            (self.delay_max_secs, self.delay_min_secs)
        };
        Duration::from_secs(rng.gen_range(lo..=hi))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner: OwnerId,
    pub name: String,
    pub status: CampaignStatus,
    pub templates: Vec<String>,
    /// Sent once by a worker right after it takes over an item.
    pub initial_message: Option<String>,
    pub schedule: CampaignSchedule,
    pub total_actions: u64,
    pub successful_actions: u64,
    pub failed_actions: u64,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(owner: OwnerId, name: impl Into<String>) -> Self {
        Self {
            id: CampaignId::new(),
            owner,
            name: name.into(),
            status: CampaignStatus::Draft,
            templates: Vec::new(),
            initial_message: None,
            schedule: CampaignSchedule::default(),
            total_actions: 0,
            successful_actions: 0,
            failed_actions: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }

    pub fn add_template(&mut self, template: impl Into<String>) -> DomainResult<()> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(DomainError::validation("template must not be empty"));
        }
        self.templates.push(template);
        Ok(())
    }

    pub fn activate(&mut self) -> DomainResult<()> {
        if !matches!(self.status, CampaignStatus::Draft | CampaignStatus::Paused) {
            return Err(DomainError::transition(format!(
                "cannot activate campaign in {:?}",
                self.status
            )));
        }
        if self.templates.is_empty() {
            return Err(DomainError::validation("campaign requires at least one template"));
        }
        self.status = CampaignStatus::Active;
        Ok(())
    }

    pub fn pause(&mut self) -> DomainResult<()> {
        if self.status != CampaignStatus::Active {
            return Err(DomainError::transition("only active campaigns can be paused"));
        }
        self.status = CampaignStatus::Paused;
        Ok(())
    }

    pub fn complete(&mut self) {
        self.status = CampaignStatus::Completed;
    }

    pub fn pick_template<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        self.templates.choose(rng).map(String::as_str)
    }

    pub fn record_result(&mut self, success: bool) {
        self.total_actions += 1;
        if success {
            self.successful_actions += 1;
        } else {
            self.failed_actions += 1;
        }
    }
}

impl Entity for Campaign {
    type Id = CampaignId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn activation_requires_template() {
        let mut c = Campaign::new(OwnerId::new(), "launch");
        assert!(c.activate().is_err());
        c.add_template("nice post").unwrap();
        c.activate().unwrap();
        assert!(c.is_active());
        c.pause().unwrap();
        c.activate().unwrap();
        c.complete();
        assert!(c.activate().is_err());
    }

    #[test]
    fn batch_cadence_follows_interval() {
        let mut schedule = CampaignSchedule {
            batch_interval_secs: 3600,
            ..CampaignSchedule::default()
        };
        let now = Utc::now();
        assert!(schedule.can_send_batch(now));

        schedule.record_batch_sent(now);
        assert!(!schedule.can_send_batch(now + ChronoDuration::minutes(59)));
        assert!(schedule.can_send_batch(now + ChronoDuration::minutes(60)));
    }

    #[test]
    fn picks_delay_within_bounds() {
        let schedule = CampaignSchedule::default();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let d = schedule.pick_delay(&mut rng).as_secs();
            assert!((17..=23).contains(&d));
        }
    }

    #[test]
    fn results_update_counters() {
        let mut c = Campaign::new(OwnerId::new(), "launch");
        c.record_result(true);
        c.record_result(false);
        assert_eq!((c.total_actions, c.successful_actions, c.failed_actions), (2, 1, 1));
        assert!(c.pick_template(&mut rand::thread_rng()).is_none());
    }
}
