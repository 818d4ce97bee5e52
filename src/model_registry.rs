use serde::Serialize;

pub const CATALOG: &[(&str, &str)] = &[
    ("anthropic/claude-3.7-sonnet", "anthropic"),
    ("anthropic/claude-3.5-sonnet", "anthropic"),
    ("anthropic/claude-3.5-haiku", "anthropic"),
];

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
    pub permission: Vec<ModelPermission>,
    pub root: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelPermission {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub allow_create_engine: bool,
    pub allow_sampling: bool,
    pub allow_logprobs: bool,
    pub allow_search_indices: bool,
    pub allow_view: bool,
    pub allow_fine_tuning: bool,
    pub organization: &'static str,
    pub group: Option<String>,
    pub is_blocking: bool,
}

impl ModelDescriptor {
    pub fn new(id: &str, owned_by: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "model",
            created: 0,
            owned_by: owned_by.to_string(),
            permission: vec![ModelPermission {
                id: format!("modelperm-{id}"),
                object: "model_permission",
                created: 0,
                allow_create_engine: false,
                allow_sampling: true,
                allow_logprobs: false,
                allow_search_indices: false,
                allow_view: true,
                allow_fine_tuning: false,
                organization: "*",
                group: None,
                is_blocking: false,
            }],
            root: id.to_string(),
            parent: None,
        }
    }
}

/// Static list served by `GET /v1/models`.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self {
            models: CATALOG
                .iter()
                .map(|(id, owner)| ModelDescriptor::new(id, owner))
                .collect(),
        }
    }
}

impl ModelRegistry {
    pub fn list(&self) -> ModelList {
        ModelList {
            object: "list",
            data: self.models.clone(),
        }
    }
}
