use std::sync::Arc;

use futures::future::join_all;

use crate::alerts::AlertSink;
use crate::builder::prepuller::PrepullerBuilder;
use crate::constants::PREPULLER_POD_TIMEOUT;
use crate::errors::Result;
use crate::kubernetes::metadata::MetadataStorage;
use crate::kubernetes::pod::PodStorage;
use crate::models::rspimage::RspImage;
use crate::timeout::Timeout;
use super::image::ImageService;

/// Prepull images to Kubernetes nodes.
///
/// A process-wide singleton driven by the image service's refresh signal.
/// Nodes are worked in parallel, but each node pulls one image at a time so
/// that prepulling does not saturate node I/O.
pub struct Prepuller {
    image_service: Arc<ImageService>,
    builder: PrepullerBuilder,
    metadata: Arc<MetadataStorage>,
    pods: Arc<PodStorage>,
    alerts: AlertSink,
}

impl Prepuller {
    pub fn new(
        image_service: Arc<ImageService>,
        builder: PrepullerBuilder,
        metadata: Arc<MetadataStorage>,
        pods: Arc<PodStorage>,
        alerts: AlertSink,
    ) -> Self {
        Prepuller { image_service, builder, metadata, pods, alerts }
    }

    /// Prepull all missing images, one worker per node.
    pub async fn prepull_images(&self) -> Result<()> {
        let missing_by_node = self.image_service.missing_images_by_node();
        let workers = missing_by_node.into_iter().map(|(node, images)| async move {
            debug!(node = node.as_str(), "Creating prepull worker for node");
            self.prepull_images_for_node(&node, images).await;
        });
        join_all(workers).await;
        debug!("Finished prepulling all images");
        Ok(())
    }

    /// Work through one node's missing images sequentially.
    async fn prepull_images_for_node(&self, node: &str, images: Vec<RspImage>) {
        let tags: Vec<&str> = images.iter().map(|i| i.tag_name()).collect();
        info!(node, images = ?tags, "Beginning prepulls for node");
        for image in images {
            self.prepull_image(&image, node).await;
            self.image_service.mark_prepulled(&image, node);
        }
        info!(node, "Finished prepulls for node");
    }

    /// Prepull one image to one node.
    ///
    /// Failures, including timeouts, are logged and alerted but never abort
    /// the worker; the image stays on the missing list and is retried on
    /// the next refresh.
    async fn prepull_image(&self, image: &RspImage, node: &str) {
        let namespace = self.metadata.namespace().to_string();
        let timeout = Timeout::new("Prepulling image", PREPULLER_POD_TIMEOUT, None);
        debug!(node, image = image.tag_name(), "Prepulling image");
        let pod = self.builder.build_pod(image, node, &self.metadata);
        let name = pod.metadata.name.clone().unwrap_or_default();

        let result = async {
            self.pods.objects().create(&namespace, &pod, &timeout, true, None).await?;
            self.pods.delete_after_completion(&name, &namespace, &timeout).await
        }
        .await;
        match result {
            Ok(()) => {
                info!(node, image = image.tag_name(), delay = ?timeout.elapsed(), "Prepulled image");
            }
            Err(error) => {
                error!(node, image = image.tag_name(), error = %error, "Failed to prepull image");
                self.alerts.post_error(&error, None).await;
            }
        }
    }
}
