use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::worker::runnable::{JobContext, JobError, Runnable};

/// Does nothing for `take_time` seconds. Its input autoflows on branch 1.
pub struct Dummy;

#[async_trait]
impl Runnable for Dummy {
    fn param_defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("take_time".to_string(), json!(0));
        defaults
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        super::take_time(ctx).await
    }
}
