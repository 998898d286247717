//! Collection creation: materialize the collection document, then hand off
//! to the scan queue. Idempotent against redelivery: an existing document
//! or job record is reused rather than duplicated.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use imageviewer_model::{
    BackgroundJob, Collection, CollectionCreationMessage, CollectionScanMessage, JobType,
    MessageOrigin, MessageType,
};

use crate::broker::{Delivery, MessageBroker, publish_message};
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::store::{CollectionStore, JobStore};

#[derive(Clone)]
pub struct CollectionCreationWorker {
    collections: Arc<dyn CollectionStore>,
    jobs: Arc<dyn JobStore>,
    broker: Arc<dyn MessageBroker>,
}

impl std::fmt::Debug for CollectionCreationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionCreationWorker").finish_non_exhaustive()
    }
}

impl CollectionCreationWorker {
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            collections,
            jobs,
            broker,
        }
    }

    pub async fn handle_creation(&self, message: &CollectionCreationMessage) -> Result<()> {
        let collection = match self.collections.find_by_path(&message.path).await? {
            Some(existing) => existing,
            None => {
                let mut collection =
                    Collection::new(&message.name, &message.path, message.collection_type);
                collection.use_direct_access = message.use_direct_file_access;
                self.collections.insert(&collection).await?;
                info!(collection_id = %collection.id, path = %message.path, "created collection");
                collection
            }
        };

        if self.jobs.get_job(message.job_id).await?.is_none() {
            let mut job = BackgroundJob::for_collection(JobType::CollectionScan, collection.id);
            job.id = message.job_id;
            self.jobs.create_job(&job).await?;
        }

        let scan = CollectionScanMessage {
            collection_id: collection.id,
            collection_path: collection.path.clone(),
            collection_type: collection.collection_type,
            force_rescan: message.force_rescan,
            use_direct_file_access: message.use_direct_file_access,
            job_id: message.job_id,
            origin: MessageOrigin::system("collection-creation-worker"),
        };
        publish_message(self.broker.as_ref(), MessageType::CollectionScan, &scan).await
    }
}

#[async_trait]
impl MessageHandler for CollectionCreationWorker {
    fn message_type(&self) -> MessageType {
        MessageType::CollectionCreation
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let message: CollectionCreationMessage = delivery.envelope.decode()?;
        self.handle_creation(&message).await
    }
}
