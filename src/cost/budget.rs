//! Daily spending limit

use crate::orchestrator::BudgetGuard;
use chrono::{Local, NaiveDate};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Debug)]
struct BudgetState {
    limit: Option<f64>,
    spent: f64,
    day: NaiveDate,
}

impl BudgetState {
    fn roll_over(&mut self, today: NaiveDate) {
        if today > self.day {
            self.spent = 0.0;
            self.day = today;
            info!("Daily budget reset");
        }
    }
}

/// Spending cap that starts over at local midnight
#[derive(Debug)]
pub struct DailyBudget {
    state: Mutex<BudgetState>,
}

impl DailyBudget {
    pub fn new(limit: Option<f64>) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                limit,
                spent: 0.0,
                day: today(),
            }),
        }
    }

    /// Budget that allows every call but still tracks spend
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    fn state(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the cap in USD; today's spend starts over
    pub fn set_limit(&self, limit: f64) {
        let mut state = self.state();
        state.limit = Some(limit);
        state.spent = 0.0;
        state.day = today();
        info!("Daily budget set to ${:.2}", limit);
    }

    pub fn limit(&self) -> Option<f64> {
        self.state().limit
    }

    pub fn spent_today(&self) -> f64 {
        let mut state = self.state();
        state.roll_over(today());
        state.spent
    }

    fn allows_on(&self, estimated_cost: f64, day: NaiveDate) -> bool {
        let mut state = self.state();
        state.roll_over(day);

        match state.limit {
            Some(limit) if state.spent + estimated_cost > limit => {
                warn!(
                    "Daily budget exceeded: ${:.4} + ${:.4} > ${:.2}",
                    state.spent, estimated_cost, limit
                );
                false
            }
            _ => true,
        }
    }

    fn record_spend_on(&self, actual_cost: f64, day: NaiveDate) {
        let mut state = self.state();
        state.roll_over(day);
        state.spent += actual_cost;
    }
}

impl BudgetGuard for DailyBudget {
    fn allows(&self, estimated_cost: f64) -> bool {
        self.allows_on(estimated_cost, today())
    }

    fn record_spend(&self, actual_cost: f64) {
        self.record_spend_on(actual_cost, today());
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
