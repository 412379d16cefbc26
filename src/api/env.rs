use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::allocation::AllocationContext;

pub struct Env<B, C> {
    pub context: Arc<AllocationContext<B, C>>,
    pub cancel_token: CancellationToken,
}

impl<B, C> Clone for Env<B, C> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }
}
