use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("policy_agent")));

#[derive(Clone, Default)]
pub struct ServerMetrics {
    pub messages: Family<MessageLabels, Counter>,
    pub reconciliations: Family<OutcomeLabels, Counter>,
    pub connections: Counter,
    pub teardown_errors: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    pub kind: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

impl ServerMetrics {
    /// Register server metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "messages",
            "Policy engine messages processed",
            self.messages.clone(),
        );
        r.register(
            "reconciliations",
            "Pending state reconciliations",
            self.reconciliations.clone(),
        );
        r.register(
            "connections",
            "Accepted policy engine connections",
            self.connections.clone(),
        );
        r.register(
            "teardown_errors",
            "Dataplane failures while tearing down a configured generation",
            self.teardown_errors.clone(),
        );
        self
    }

    /// Metrics registered in the process wide registry.
    pub fn registered() -> Self {
        let metrics = Self::default();
        match REGISTRY.write() {
            Ok(mut registry) => metrics.register(&mut registry),
            Err(_) => metrics,
        }
    }

    pub fn message(&self, kind: &str, ok: bool) {
        self.messages
            .get_or_create(&MessageLabels {
                kind: kind.to_string(),
                outcome: outcome(ok).to_string(),
            })
            .inc();
    }

    pub fn reconciliation(&self, ok: bool) {
        self.reconciliations
            .get_or_create(&OutcomeLabels {
                outcome: outcome(ok).to_string(),
            })
            .inc();
    }
}

fn outcome(ok: bool) -> &'static str {
    if ok { "success" } else { "error" }
}
