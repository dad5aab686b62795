use stackable_operator::k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector};

pub fn env_var(var_name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: String::from(var_name),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Exposes a field of the Pod (downward API) as environment variable.
pub fn env_var_from_field(var_name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: String::from(var_name),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: String::from(field_path),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
