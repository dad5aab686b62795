//! Brings the cluster in line with the [`DesiredResources`] of an Image.
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    client::Client,
    k8s_openapi::api::{batch::v1::Job, core::v1::ConfigMap},
    kube::{
        ResourceExt,
        api::{Api, DeleteParams, ListParams},
    },
};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{
    IMAGE_CONTROLLER_NAME,
    build::BUILDER_ROLE,
    lifecycle,
    types::{ChildResource, DesiredResources},
};
use crate::crd::APP_NAME;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to apply {kind} [{name}]"))]
    ApplyChild {
        source: stackable_operator::client::Error,
        kind: &'static str,
        name: String,
    },

    #[snafu(display("failed to get Job [{name}]"))]
    GetJob {
        source: stackable_operator::client::Error,
        name: String,
    },

    #[snafu(display("failed to delete outdated Job [{name}]"))]
    DeleteJob {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to list ConfigMaps of Image [{name}]"))]
    ListConfigMaps {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to delete orphaned ConfigMap [{name}]"))]
    DeleteConfigMap {
        source: stackable_operator::kube::Error,
        name: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Result of a single apply pass.
#[derive(Debug)]
pub enum Applied {
    /// Every child is in place, the Job is the one currently in the cluster.
    Ready(Job),
    /// An outdated Job has been deleted and has to disappear before the new
    /// one can be created.
    JobReplaced,
}

/// Applies the children of an Image in dependency order.
///
/// A Job whose Pod template differs from the desired one is deleted instead
/// of patched, because Job templates are immutable. ConfigMaps that belonged
/// to previous configurations are removed once the current ones are applied.
pub async fn apply_resources(
    client: &Client,
    image_name: &str,
    namespace: &str,
    desired: &DesiredResources,
) -> Result<Applied> {
    for child in desired.in_apply_order() {
        let (kind, name, applied) = match child {
            ChildResource::ServiceAccount(sa) => (
                "ServiceAccount",
                sa.name_any(),
                client.apply_patch(IMAGE_CONTROLLER_NAME, sa, sa).await.map(drop),
            ),
            ChildResource::Role(role) => (
                "Role",
                role.name_any(),
                client.apply_patch(IMAGE_CONTROLLER_NAME, role, role).await.map(drop),
            ),
            ChildResource::RoleBinding(rb) => (
                "RoleBinding",
                rb.name_any(),
                client.apply_patch(IMAGE_CONTROLLER_NAME, rb, rb).await.map(drop),
            ),
            ChildResource::ConfigMap(cm) => (
                "ConfigMap",
                cm.name_any(),
                client.apply_patch(IMAGE_CONTROLLER_NAME, cm, cm).await.map(drop),
            ),
            // needs the outdated check below
            ChildResource::Job(_) => continue,
        };
        applied.context(ApplyChildSnafu { kind, name })?;
    }

    let name = desired.job.name_any();
    let existing = client
        .get_opt::<Job>(&name, namespace)
        .await
        .context(GetJobSnafu { name: &name })?;

    if let Some(existing) = existing {
        if lifecycle::job_is_outdated(&existing, &desired.template_hash) {
            tracing::info!(job = name, "Pod template changed, recreating Job");
            Api::<Job>::namespaced(client.as_kube_client(), namespace)
                .delete(&name, &DeleteParams::background())
                .await
                .context(DeleteJobSnafu { name: &name })?;
            return Ok(Applied::JobReplaced);
        }
    }

    let job = client
        .apply_patch(IMAGE_CONTROLLER_NAME, &desired.job, &desired.job)
        .await
        .context(ApplyChildSnafu { kind: "Job", name })?;

    delete_orphaned_config_maps(client, image_name, namespace, desired).await?;
    Ok(Applied::Ready(job))
}

fn children_selector(image_name: &str) -> String {
    format!(
        "app.kubernetes.io/name={APP_NAME},app.kubernetes.io/instance={image_name},app.kubernetes.io/component={BUILDER_ROLE}"
    )
}

async fn delete_orphaned_config_maps(
    client: &Client,
    image_name: &str,
    namespace: &str,
    desired: &DesiredResources,
) -> Result<()> {
    let api = Api::<ConfigMap>::namespaced(client.as_kube_client(), namespace);
    let existing = api
        .list(&ListParams::default().labels(&children_selector(image_name)))
        .await
        .context(ListConfigMapsSnafu { name: image_name })?;

    let wanted = desired.config_map_names().collect::<Vec<_>>();
    for cm in existing {
        let name = cm.name_any();
        if wanted.contains(&name) {
            continue;
        }
        tracing::info!(config_map = name, "deleting orphaned ConfigMap");
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(stackable_operator::kube::Error::Api(err)) if err.code == 404 => {}
            Err(err) => return Err(err).context(DeleteConfigMapSnafu { name }),
        }
    }
    Ok(())
}
