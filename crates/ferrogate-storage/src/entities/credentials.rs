use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// A single [`Key`](ferrogate_protocol::Key) row. `secret_json` holds the
/// serialized `KeyValue` (plain string or provider-specific config blob);
/// `eligible_models_json` holds the `Vec<String>` allow-list, empty meaning
/// "any model".
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub name: String,
    pub secret_json: Json,
    pub eligible_models_json: Json,
    pub weight: i32,
    pub enabled: bool,
    pub use_for_batch_api: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
