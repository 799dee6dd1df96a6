//! Filter pipeline.
//!
//! Runs ordered pre-filters (inlet) before dispatch and post-filters
//! (outlet) after the result is produced. Filters are external HTTP
//! collaborators; a failing filter (network error, timeout, non-2xx) is
//! logged and skipped — treated as identity — and iteration continues.
//! No filter failure ever aborts the request: the user's message still
//! makes progress when an optional enrichment or guardrail service is
//! down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cancel::CancellationSignal;
use crate::error::DispatchError;
use crate::model::FilterDescriptor;

/// Which side of dispatch a filter call is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Inlet,
    Outlet,
}

impl FilterStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterStage::Inlet => "inlet",
            FilterStage::Outlet => "outlet",
        }
    }
}

/// Transport seam for filter endpoint calls. The HTTP implementation is
/// the production one; tests substitute in-process fakes.
#[async_trait]
pub trait FilterTransport: Send + Sync {
    async fn call(
        &self,
        filter: &FilterDescriptor,
        stage: FilterStage,
        payload: &Value,
    ) -> Result<Value, DispatchError>;
}

/// `POST {base}/{id}/filter/{inlet|outlet}` with the payload as JSON body.
pub struct HttpFilterTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFilterTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl FilterTransport for HttpFilterTransport {
    async fn call(
        &self,
        filter: &FilterDescriptor,
        stage: FilterStage,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let url = format!(
            "{}/{}/filter/{}",
            filter.base_url.trim_end_matches('/'),
            filter.id,
            stage.as_str()
        );

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| DispatchError::FilterFailure {
                id: filter.id.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::FilterFailure {
                id: filter.id.clone(),
                reason: format!("endpoint returned {}", status),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| DispatchError::FilterFailure {
                id: filter.id.clone(),
                reason: format!("invalid response body: {}", e),
            })
    }
}

/// Deterministic execution order: ascending priority, ties broken by id.
pub fn ordered(mut filters: Vec<FilterDescriptor>) -> Vec<FilterDescriptor> {
    filters.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
    filters
}

pub struct FilterPipeline {
    transport: Arc<dyn FilterTransport>,
}

impl FilterPipeline {
    pub fn new(transport: Arc<dyn FilterTransport>) -> Self {
        Self { transport }
    }

    pub fn http(timeout: Duration) -> Self {
        Self::new(Arc::new(HttpFilterTransport::new(timeout)))
    }

    /// Run the inlet chain over a request payload.
    pub async fn apply_inlet<T>(
        &self,
        payload: &T,
        filters: Vec<FilterDescriptor>,
        signal: &CancellationSignal,
    ) -> T
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        self.apply(FilterStage::Inlet, payload, filters, signal).await
    }

    /// Run the outlet chain over a response payload.
    pub async fn apply_outlet<T>(
        &self,
        payload: &T,
        filters: Vec<FilterDescriptor>,
        signal: &CancellationSignal,
    ) -> T
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        self.apply(FilterStage::Outlet, payload, filters, signal)
            .await
    }

    async fn apply<T>(
        &self,
        stage: FilterStage,
        payload: &T,
        filters: Vec<FilterDescriptor>,
        signal: &CancellationSignal,
    ) -> T
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let mut current = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(stage = stage.as_str(), "Failed to serialize filter payload: {}", e);
                return payload.clone();
            }
        };

        for filter in ordered(filters) {
            // Cancellation is observed between filter invocations, not
            // mid-call.
            if signal.is_cancelled() {
                break;
            }

            match self.invoke_one(&filter, stage, &current).await {
                Ok(next) => {
                    // A response that no longer parses as the payload shape
                    // counts as a filter failure; the chain keeps the last
                    // good payload.
                    if serde_json::from_value::<T>(next.clone()).is_ok() {
                        current = next;
                    } else {
                        tracing::warn!(
                            filter = %filter.id,
                            stage = stage.as_str(),
                            "Filter returned malformed payload; skipping"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        filter = %filter.id,
                        stage = stage.as_str(),
                        error = %e,
                        "Filter failed; skipping"
                    );
                }
            }
        }

        match serde_json::from_value(current) {
            Ok(transformed) => transformed,
            Err(e) => {
                tracing::warn!(
                    stage = stage.as_str(),
                    "Filtered payload no longer matches expected shape; using original: {}",
                    e
                );
                payload.clone()
            }
        }
    }

    /// One filter call. The output must still parse as a payload of the
    /// expected shape, otherwise the filter is treated as failed.
    async fn invoke_one(
        &self,
        filter: &FilterDescriptor,
        stage: FilterStage,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        self.transport.call(filter, stage, payload).await
    }
}
