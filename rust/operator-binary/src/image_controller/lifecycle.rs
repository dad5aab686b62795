//! The deletion state machine of an Image and the interpretation of its Job.
use stackable_operator::{
    k8s_openapi::api::batch::v1::Job,
    kube::{Resource, ResourceExt},
};

use crate::crd::{FINALIZER_NAME, ImageStatus, v1alpha1};

/// What a reconciliation pass has to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleStep {
    /// The Image does not exist anymore.
    Gone,
    /// The Image is alive but not yet protected by the finalizer.
    AddFinalizer,
    /// The Image is being deleted and external cleanup is still pending.
    Finalize,
    /// The Image is being deleted and nothing is left to clean up.
    AlreadyFinalized,
    /// The Image is alive and protected, its children have to be ensured.
    Ensure,
}

pub fn next_step(image: Option<&v1alpha1::Image>) -> LifecycleStep {
    let Some(image) = image else {
        return LifecycleStep::Gone;
    };

    let has_finalizer = has_finalizer(image);
    match (image.meta().deletion_timestamp.is_some(), has_finalizer) {
        (true, true) => LifecycleStep::Finalize,
        (true, false) => LifecycleStep::AlreadyFinalized,
        (false, false) => LifecycleStep::AddFinalizer,
        (false, true) => LifecycleStep::Ensure,
    }
}

pub fn has_finalizer(image: &v1alpha1::Image) -> bool {
    image.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// The finalizers of `image` after adding ours.
pub fn finalizers_with(image: &v1alpha1::Image) -> Vec<String> {
    let mut finalizers = image.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == FINALIZER_NAME) {
        finalizers.push(FINALIZER_NAME.to_string());
    }
    finalizers
}

/// The finalizers of `image` after removing ours.
pub fn finalizers_without(image: &v1alpha1::Image) -> Vec<String> {
    image
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER_NAME)
        .cloned()
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed { message: String },
}

pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = &job.status else {
        return JobOutcome::Running;
    };

    if status.succeeded.unwrap_or_default() > 0 {
        return JobOutcome::Succeeded;
    }

    let failed_condition = status.conditions.iter().flatten().find(|condition| {
        condition.type_ == "Failed" && condition.status == "True"
    });
    if let Some(condition) = failed_condition {
        let message = condition
            .message
            .clone()
            .or_else(|| condition.reason.clone())
            .unwrap_or_else(|| "Job failed".to_string());
        return JobOutcome::Failed { message };
    }

    JobOutcome::Running
}

/// The status to persist for `outcome`, if it differs from `current`.
///
/// Readiness is only ever switched on. A failed or running build leaves the
/// status as it is.
pub fn status_update(current: Option<&ImageStatus>, outcome: &JobOutcome) -> Option<ImageStatus> {
    match outcome {
        JobOutcome::Succeeded if !current.is_some_and(|status| status.ready) => {
            Some(ImageStatus { ready: true })
        }
        _ => None,
    }
}

/// Whether an existing Job was built from a different Pod template.
pub fn job_is_outdated(existing: &Job, template_hash: &str) -> bool {
    existing
        .annotations()
        .get(crate::crd::TEMPLATE_HASH_ANNOTATION)
        .is_none_or(|hash| hash != template_hash)
}
