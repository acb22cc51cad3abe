use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Admission verdict counters, exposed on the admin server.
#[derive(Clone, Debug)]
pub struct Metrics {
    requests: Family<Labels, Counter>,
}

/// Review endpoint a verdict was produced for.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    Mutate,
    ValidateConf,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Outcome {
    Allowed,
    Denied,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Labels {
    endpoint: Endpoint,
    outcome: Outcome,
}

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<Labels, Counter>::default();
        reg.register(
            "requests",
            "Admission review verdicts by endpoint",
            requests.clone(),
        );
        Self { requests }
    }

    pub fn observe(&self, endpoint: Endpoint, allowed: bool) {
        let outcome = if allowed {
            Outcome::Allowed
        } else {
            Outcome::Denied
        };
        self.requests
            .get_or_create(&Labels { endpoint, outcome })
            .inc();
    }
}
