//! Ensures that a build `Job` and everything it needs exists for each [`v1alpha1::Image`],
//! and that the artifacts it uploaded are removed again once the Image is deleted.
use std::sync::Arc;

use const_format::concatcp;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    kube::{
        ResourceExt,
        core::{DeserializeGuard, error_boundary},
        runtime::controller::Action,
    },
    logging::controller::ReconcilerError,
    time::Duration,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::crd::{OPERATOR_NAME, v1alpha1};

mod apply;
mod build;
mod data_source;
mod finalize;
mod lifecycle;
mod types;

use lifecycle::{JobOutcome, LifecycleStep};

pub const IMAGE_CONTROLLER_NAME: &str = "image";
pub const IMAGE_FULL_CONTROLLER_NAME: &str = concatcp!(IMAGE_CONTROLLER_NAME, '.', OPERATOR_NAME);

pub struct Ctx {
    pub client: stackable_operator::client::Client,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("Image object is invalid"))]
    InvalidImage {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to get Image [{name}]"))]
    GetImage {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to build resources for Image"))]
    BuildResources { source: build::Error },

    #[snafu(display("failed to apply resources for Image"))]
    ApplyResources { source: apply::Error },

    #[snafu(display("failed to update finalizers"))]
    UpdateFinalizer { source: finalize::Error },

    #[snafu(display("failed to clean up build artifacts"))]
    PurgeOutputs { source: finalize::Error },

    #[snafu(display("build Job failed: {message}"))]
    BuildFailed { message: String },

    #[snafu(display("failed to update status"))]
    ApplyStatus {
        source: stackable_operator::client::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_image(
    image: Arc<DeserializeGuard<v1alpha1::Image>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");

    let image = image
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidImageSnafu)?;

    let client = &ctx.client;
    let name = image.name_any();
    let namespace = image.namespace().context(ObjectHasNoNamespaceSnafu)?;

    // The cached object may be stale, the finalizer and deletion state have to be current.
    let current = client
        .get_opt::<v1alpha1::Image>(&name, &namespace)
        .await
        .context(GetImageSnafu { name: &name })?;

    match lifecycle::next_step(current.as_ref()) {
        LifecycleStep::Gone | LifecycleStep::AlreadyFinalized => Ok(Action::await_change()),
        LifecycleStep::AddFinalizer => {
            let image = current.as_ref().unwrap_or(image);
            finalize::add_finalizer(client, image)
                .await
                .context(UpdateFinalizerSnafu)?;
            Ok(Action::requeue(*Duration::from_secs(0)))
        }
        LifecycleStep::Finalize => {
            let image = current.as_ref().unwrap_or(image);
            finalize::purge_outputs(client, image)
                .await
                .context(PurgeOutputsSnafu)?;
            finalize::remove_finalizer(client, image)
                .await
                .context(UpdateFinalizerSnafu)?;
            tracing::info!("finalized Image");
            Ok(Action::await_change())
        }
        LifecycleStep::Ensure => {
            let image = current.as_ref().unwrap_or(image);
            ensure(client, image, &name, &namespace).await
        }
    }
}

async fn ensure(
    client: &stackable_operator::client::Client,
    image: &v1alpha1::Image,
    name: &str,
    namespace: &str,
) -> Result<Action> {
    let desired = build::build_resources(image).context(BuildResourcesSnafu)?;

    let job = match apply::apply_resources(client, name, namespace, &desired)
        .await
        .context(ApplyResourcesSnafu)?
    {
        apply::Applied::Ready(job) => job,
        apply::Applied::JobReplaced => return Ok(Action::requeue(*Duration::from_secs(5))),
    };

    let outcome = lifecycle::job_outcome(&job);
    if let JobOutcome::Failed { message } = outcome {
        return BuildFailedSnafu { message }.fail();
    }

    if let Some(status) = lifecycle::status_update(image.status.as_ref(), &outcome) {
        client
            .apply_patch_status(OPERATOR_NAME, image, &status)
            .await
            .context(ApplyStatusSnafu)?;
        tracing::info!("Image is ready");
    }

    Ok(Action::await_change())
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<v1alpha1::Image>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        // root object is invalid, will be requeued when modified anyway
        Error::InvalidImage { .. } => Action::await_change(),
        // the Job changing state triggers the next pass
        Error::BuildFailed { .. } => Action::await_change(),
        Error::BuildResources {
            source: build::Error::InvalidSpec { .. },
        } => Action::await_change(),

        _ => Action::requeue(*Duration::from_secs(10)),
    }
}
