// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Shared test scaffolding: a scripted step factory
//!
//! `TestFactory` covers the factory/instance contract with configurable
//! identity, labels, result, and checkpoint validity, and can record which
//! handles actually executed into a shared log.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::step::{ExecutionContext, InputLabels, Step, StepFactory, StepInputs};

type Transform = Arc<dyn Fn(&StepInputs) -> Value + Send + Sync>;

/// Install a tracing subscriber for test debugging; safe to call often
pub(crate) fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

/// Shared record of executed step ids, in completion order of `execute`
#[derive(Clone, Default)]
pub(crate) struct ExecutionLog(Arc<Mutex<Vec<usize>>>);

impl ExecutionLog {
    pub fn record(&self, id: usize) {
        self.0.lock().unwrap().push(id);
    }

    pub fn executed(&self) -> Vec<usize> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Configurable scripted step factory
pub(crate) struct TestFactory {
    identity: String,
    labels: InputLabels,
    format: String,
    result: Value,
    transform: Option<Transform>,
    log: Option<ExecutionLog>,
    valid: bool,
    accepts: bool,
    fail: bool,
}

impl TestFactory {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            labels: InputLabels::none(),
            format: "json".to_string(),
            result: Value::Null,
            transform: None,
            log: None,
            valid: true,
            accepts: true,
            fail: false,
        }
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = InputLabels::fixed(labels.iter().copied());
        self
    }

    pub fn with_wildcard_labels(mut self, labels: &[&str]) -> Self {
        self.labels = InputLabels::fixed(labels.iter().copied()).with_wildcard();
        self
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = format.to_string();
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    /// Compute the result from the received inputs instead of a constant
    pub fn with_transform(
        mut self,
        transform: impl Fn(&StepInputs) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn recording(mut self, log: &ExecutionLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// Report every prior checkpoint as invalid
    pub fn invalid_checkpoints(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Refuse every upstream connection
    pub fn rejecting_upstreams(mut self) -> Self {
        self.accepts = false;
        self
    }

    /// Fail on execute
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl StepFactory for TestFactory {
    fn type_identity(&self) -> &str {
        &self.identity
    }

    fn input_labels(&self) -> InputLabels {
        self.labels.clone()
    }

    fn accepts_upstream(&self, _upstream: &dyn StepFactory, _label: &str) -> bool {
        self.accepts
    }

    fn data_format(&self) -> &str {
        &self.format
    }

    fn instantiate(&self, _config: &Value) -> anyhow::Result<Box<dyn Step>> {
        Ok(Box::new(TestStep {
            result: self.result.clone(),
            transform: self.transform.clone(),
            log: self.log.clone(),
            valid: self.valid,
            fail: self.fail,
        }))
    }
}

struct TestStep {
    result: Value,
    transform: Option<Transform>,
    log: Option<ExecutionLog>,
    valid: bool,
    fail: bool,
}

#[async_trait]
impl Step for TestStep {
    async fn execute(
        &mut self,
        inputs: StepInputs,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<Value> {
        if self.fail {
            anyhow::bail!("synthetic step failure");
        }
        if let Some(log) = &self.log {
            log.record(ctx.handle().raw_id());
        }
        match &self.transform {
            Some(transform) => Ok(transform(&inputs)),
            None => Ok(self.result.clone()),
        }
    }

    fn checkpoint_metadata(&self) -> Value {
        serde_json::json!({"produced-by": "test"})
    }

    fn checkpoint_is_valid(&self, _metadata: &Value) -> bool {
        self.valid
    }
}
