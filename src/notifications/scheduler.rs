//! Daily notification scheduler.
//!
//! A single background task wakes on a fixed interval and runs every job
//! whose UTC time slot has passed and that has not yet run today. Jobs whose
//! slot had already passed when the process started wait until tomorrow, so
//! a restart never double-sends.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::jobs::{self, Job};
use super::Notifier;
use crate::config::ScheduleConfig;

const TICK: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Schedule {
    slots: Vec<(Job, NaiveTime)>,
    last_run: HashMap<Job, NaiveDate>,
}

impl Schedule {
    pub fn new(config: &ScheduleConfig, started_at: DateTime<Utc>) -> Self {
        let slots = vec![
            (Job::CustomerEssentials, config.customer_essentials),
            (Job::OwnerMorning, config.owner_morning),
            (Job::SubscriptionReminders, config.subscription_reminders),
            (Job::CustomerDeals, config.customer_deals),
            (Job::OwnerEvening, config.owner_evening),
            (Job::OwnerNight, config.owner_night),
        ];
        let today = started_at.date_naive();
        let last_run = slots
            .iter()
            .filter(|(_, at)| *at <= started_at.time())
            .map(|(job, _)| (*job, today))
            .collect();
        Self { slots, last_run }
    }

    /// Jobs to run now; each is marked as done for today.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        let today = now.date_naive();
        let mut due = Vec::new();
        for (job, at) in &self.slots {
            if now.time() >= *at && self.last_run.get(job) != Some(&today) {
                self.last_run.insert(*job, today);
                due.push(*job);
            }
        }
        due
    }
}

pub fn spawn(notifier: Notifier, config: ScheduleConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut schedule = Schedule::new(&config, Utc::now());
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("notification scheduler started");

        loop {
            interval.tick().await;
            let now = Utc::now();
            for job in schedule.due(now) {
                debug!(job = job.name(), "running scheduled job");
                if let Err(e) = jobs::run(&notifier, job, now).await {
                    error!(job = job.name(), error = %e, "scheduled job failed");
                }
            }
        }
    })
}
