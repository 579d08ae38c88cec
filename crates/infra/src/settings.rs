//! Operator settings for the queue.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use augur_core::Currency;

use crate::error::{QueueError, StoreError};

/// Switches an operator can flip at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// When off, the queue head is not picked up automatically.
    pub is_enabled: bool,
    pub min_amount: f64,
    pub currency: Currency,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            min_amount: 0.0,
            currency: Currency::Cny,
        }
    }
}

/// Partial change; `None` leaves a field as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub is_enabled: Option<bool>,
    pub min_amount: Option<f64>,
    pub currency: Option<Currency>,
}

impl QueueSettings {
    /// Apply `update`, rejecting it whole if any field is invalid.
    pub fn apply(self, update: &SettingsUpdate) -> Result<Self, QueueError> {
        if let Some(min) = update.min_amount {
            if !min.is_finite() || min < 0.0 {
                return Err(QueueError::Validation(format!(
                    "min_amount must be a non-negative number, got {min}"
                )));
            }
        }
        Ok(Self {
            is_enabled: update.is_enabled.unwrap_or(self.is_enabled),
            min_amount: update.min_amount.unwrap_or(self.min_amount),
            currency: update.currency.unwrap_or(self.currency),
        })
    }
}

pub trait SettingsStore: Send + Sync + 'static {
    /// Stored settings, or the defaults when none were ever saved.
    fn load(&self) -> Result<QueueSettings, StoreError>;

    fn save(&self, settings: &QueueSettings) -> Result<(), StoreError>;
}

impl<S> SettingsStore for Arc<S>
where
    S: SettingsStore + ?Sized,
{
    fn load(&self) -> Result<QueueSettings, StoreError> {
        (**self).load()
    }

    fn save(&self, settings: &QueueSettings) -> Result<(), StoreError> {
        (**self).save(settings)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    current: RwLock<QueueSettings>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn load(&self) -> Result<QueueSettings, StoreError> {
        let current = self.current.read().map_err(|_| StoreError::poisoned("settings"))?;
        Ok(*current)
    }

    fn save(&self, settings: &QueueSettings) -> Result<(), StoreError> {
        let mut current = self.current.write().map_err(|_| StoreError::poisoned("settings"))?;
        *current = *settings;
        Ok(())
    }
}
