use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::chain::types::{ApprovalChain, ChainStepDefinition};
use crate::chain::validation::{validate_chain, validate_role_references};
use crate::error::WorkflowResult;
use crate::ids::CategoryId;
use crate::store::EnrollmentStore;

/// Read-mostly lookup of approval chains, cached per category
pub struct ChainCatalog {
    store: Arc<dyn EnrollmentStore>,
    cache: Cache<CategoryId, Arc<ApprovalChain>>,
}

impl ChainCatalog {
    pub fn new(store: Arc<dyn EnrollmentStore>, capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { store, cache }
    }

    /// Ordered chain for a category.
    ///
    /// A category with no configured steps auto-approves: it gets a single
    /// implicit final step that the engine resolves on its own.
    pub async fn get_chain(&self, category_id: CategoryId) -> WorkflowResult<Arc<ApprovalChain>> {
        if let Some(chain) = self.cache.get(&category_id).await {
            debug!(category_id = %category_id, "Chain cache hit");
            return Ok(chain);
        }

        let definitions = self.store.load_chain(category_id).await?;
        let chain = if definitions.is_empty() {
            debug!(category_id = %category_id, "No chain configured, category auto-approves");
            ApprovalChain::auto_approve(category_id)
        } else {
            validate_chain(category_id, &definitions)?
        };

        let chain = Arc::new(chain);
        self.cache.insert(category_id, chain.clone()).await;
        Ok(chain)
    }

    /// Validate and store a category's chain, replacing any previous definition.
    ///
    /// Snapshots already taken by existing enrollments are not touched.
    pub async fn define_chain(
        &self,
        category_id: CategoryId,
        definitions: &[ChainStepDefinition],
    ) -> WorkflowResult<Arc<ApprovalChain>> {
        let chain = validate_chain(category_id, definitions)?;
        let known_roles = self.store.known_roles().await?;
        validate_role_references(&chain, &known_roles)?;

        self.store
            .save_chain(category_id, &chain.definitions())
            .await?;
        self.cache.invalidate(&category_id).await;

        info!(
            category_id = %category_id,
            steps = chain.len(),
            "Approval chain defined"
        );
        Ok(Arc::new(chain))
    }

    pub async fn invalidate(&self, category_id: CategoryId) {
        self.cache.invalidate(&category_id).await;
    }
}
