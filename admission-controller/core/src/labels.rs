//! Well-known label and annotation keys shared with the scheduler.

/// Value of `spec.schedulerName` for pods handed to the scheduler, and the
/// `app` label value that marks scheduler infrastructure pods.
pub const SCHEDULER_NAME: &str = "yunikorn";

/// Conventional application label, used to recognize infrastructure pods.
pub const APP_LABEL: &str = "app";

/// Canonical application-id label.
pub const APP_ID_LABEL: &str = "applicationId";

/// Application-id label written by the Spark operator. Its presence means an
/// application id must not be synthesized.
pub const SPARK_APP_SELECTOR_LABEL: &str = "spark-app-selector";

/// Queue placement label.
pub const QUEUE_LABEL: &str = "queue";

/// Queue assigned to pods that carry no queue label.
pub const DEFAULT_QUEUE: &str = "root.default";

/// Opts an application out of state-aware scheduling.
pub const DISABLE_STATE_AWARE_LABEL: &str = "yunikorn.apache.org/disable-state-aware";

/// Annotation carrying the submitter's identity as JSON.
pub const USER_INFO_ANNOTATION: &str = "yunikorn.apache.org/user.info";
