//! Runnables shipped with apiary.
//!
//! - `Dummy`: does nothing, optionally for a while
//! - `FailureTest`: fails on demand, for exercising retries and failure branches
//! - `DigitFactory`, `PartMultiply`, `AddTogether`: the long multiplication pipeline

mod dummy;
mod long_mult;

use std::time::Duration;

pub use dummy::Dummy;
pub use failure_test::FailureTest;
pub use long_mult::{AddTogether, DigitFactory, PartMultiply, add_together, multiply_by_digit};

use crate::worker::runnable::{JobContext, JobError, RunnableRegistry};

pub fn register_all(registry: &mut RunnableRegistry) {
    registry.register("Dummy", || Box::new(Dummy));
    registry.register("FailureTest", || Box::new(FailureTest));
    registry.register("DigitFactory", || Box::new(DigitFactory));
    registry.register("PartMultiply", || Box::new(PartMultiply));
    registry.register("AddTogether", || Box::new(AddTogether));
}

/// Sleep for the job's `take_time` seconds, if any.
async fn take_time(ctx: &mut JobContext) -> Result<(), JobError> {
    if let Some(secs) = ctx.param_f64("take_time")?
        && secs > 0.0
    {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let registry = RunnableRegistry::with_builtins();
        assert_eq!(
            registry.modules(),
            vec!["AddTogether", "DigitFactory", "Dummy", "FailureTest", "PartMultiply"]
        );
    }
}
