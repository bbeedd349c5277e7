//! Provider registry - maps provider ids to their clients

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::gocardless::GoCardlessProvider;
use crate::adapters::truelayer::TrueLayerProvider;
use crate::config::Config;
use crate::domain::result::{Error, Result};
use crate::domain::{Institution, ProviderId};
use crate::ports::BankingProvider;

/// Registered banking providers
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, Arc<dyn BankingProvider>>,
}

impl ProviderRegistry {
    /// Register the built-in providers with their configured credentials
    pub fn from_config(config: &Config) -> Result<Self> {
        let gocardless: Arc<dyn BankingProvider> = Arc::new(GoCardlessProvider::new(config.gocardless.clone())?);
        let truelayer: Arc<dyn BankingProvider> = Arc::new(TrueLayerProvider::new(config.truelayer.clone())?);
        Ok(Self::with_providers(vec![gocardless, truelayer]))
    }

    pub fn with_providers(providers: Vec<Arc<dyn BankingProvider>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.id(), p)).collect(),
        }
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn BankingProvider>> {
        self.providers.get(&id).cloned()
    }

    /// Provider by id, failing when it is unknown or has no credentials
    pub fn get_or_throw(&self, id: ProviderId) -> Result<Arc<dyn BankingProvider>> {
        match self.providers.get(&id) {
            Some(p) if p.is_enabled() => Ok(Arc::clone(p)),
            Some(_) => Err(Error::config(format!(
                "Provider '{}' is not configured. Add its credentials to settings.json.",
                id
            ))),
            None => Err(Error::config(format!("Provider '{}' is not registered", id))),
        }
    }

    /// Providers with credentials configured
    pub fn enabled(&self) -> Vec<Arc<dyn BankingProvider>> {
        self.providers.values().filter(|p| p.is_enabled()).cloned().collect()
    }

    pub fn for_country(&self, country: &str) -> Vec<Arc<dyn BankingProvider>> {
        self.enabled()
            .into_iter()
            .filter(|p| p.supports_country(country))
            .collect()
    }

    /// Institutions across every enabled provider for the country.
    ///
    /// A provider that fails is logged and left out.
    pub fn list_all_institutions(&self, country: &str) -> Vec<Institution> {
        let mut institutions = Vec::new();
        for provider in self.for_country(country) {
            match provider.list_institutions(country) {
                Ok(list) => institutions.extend(list),
                Err(e) => tracing::warn!(
                    provider = %provider.id(),
                    country,
                    "failed to list institutions: {}",
                    e
                ),
            }
        }
        institutions.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        institutions
    }
}
