use stackable_operator::k8s_openapi::api::{
    batch::v1::Job,
    core::v1::{ConfigMap, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};

/// Everything a reconciliation pass ensures for one Image.
#[derive(Clone, Debug)]
pub struct DesiredResources {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub role_binding: RoleBinding,
    /// The primary configuration first, followed by the fetcher configuration if any.
    pub config_maps: Vec<ConfigMap>,
    pub job: Job,
    /// Digest of the Job's Pod template, also stored as annotation on the Job.
    pub template_hash: String,
}

#[derive(Clone, Copy, Debug)]
pub enum ChildResource<'a> {
    ServiceAccount(&'a ServiceAccount),
    Role(&'a Role),
    RoleBinding(&'a RoleBinding),
    ConfigMap(&'a ConfigMap),
    Job(&'a Job),
}

impl DesiredResources {
    /// The children in the order they have to be applied in. Every entry only
    /// references entries that come before it.
    pub fn in_apply_order(&self) -> Vec<ChildResource<'_>> {
        let mut children = vec![
            ChildResource::ServiceAccount(&self.service_account),
            ChildResource::Role(&self.role),
            ChildResource::RoleBinding(&self.role_binding),
        ];
        children.extend(self.config_maps.iter().map(ChildResource::ConfigMap));
        children.push(ChildResource::Job(&self.job));
        children
    }

    pub fn config_map_names(&self) -> impl Iterator<Item = String> + '_ {
        self.config_maps
            .iter()
            .filter_map(|cm| cm.metadata.name.clone())
    }
}
