//! Admission and priority queue management.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::sources::SnapshotContext;
use crate::types::{JobId, ReleaseRequest};
use std::path::Component;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::store::JobRecord;
use super::{BookDownloader, QueuedJob};

impl BookDownloader {
    /// Submit a request under the current settings snapshot
    ///
    /// The request is validated, its adapter chain is fixed, and it is queued
    /// behind earlier jobs of the same priority.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when the request has no title or external ID,
    ///   accepts no format, names an escaping destination subpath, or no enabled
    ///   adapter can serve it
    /// - [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) has begun
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use shelf_dl::{BookDownloader, ReleaseRequest, Result};
    /// # async fn example(downloader: BookDownloader) -> Result<()> {
    /// let mut request = ReleaseRequest::new("The Left Hand of Darkness");
    /// request.author = Some("Ursula K. Le Guin".into());
    /// request.formats = vec!["epub".into()];
    /// let id = downloader.submit(request).await?;
    /// println!("queued as {id}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit(&self, request: ReleaseRequest) -> Result<JobId> {
        let snapshot = self.current_snapshot();
        self.admit(request, snapshot).await
    }

    /// Submit a request under an explicit settings snapshot
    ///
    /// The job keeps this snapshot for its whole life, regardless of later
    /// [`update_settings`](Self::update_settings) calls.
    pub async fn submit_with_settings(&self, request: ReleaseRequest, settings: Settings) -> Result<JobId> {
        settings.validate()?;
        let snapshot = SnapshotContext::new(Arc::new(settings))?;
        self.admit(request, snapshot).await
    }

    async fn admit(&self, request: ReleaseRequest, snapshot: SnapshotContext) -> Result<JobId> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        validate_request(&request, &snapshot.settings)?;

        let chain = self.resolver.chain_for(&request, &snapshot.settings);
        if chain.is_empty() {
            return Err(Error::InvalidRequest(
                "no enabled source adapter can serve this request".to_string(),
            ));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = JobId(seq);
        let priority = request.priority;

        tracing::info!(
            job_id = id.0,
            release = %request.label(),
            chain = ?chain,
            priority = ?priority,
            "job admitted"
        );

        self.store.insert(JobRecord::new(id, request, chain, snapshot));
        self.add_to_queue(QueuedJob { id, priority, seq }).await;
        Ok(id)
    }

    /// Push a job onto the priority queue and wake the processor
    pub(crate) async fn add_to_queue(&self, item: QueuedJob) {
        self.queue_state.queue.lock().await.push(item);
        self.queue_state.wakeup.notify_one();
    }

    /// Remove a job from the priority queue without starting it
    ///
    /// Returns true if the job was found and removed.
    pub(crate) async fn remove_from_queue(&self, id: JobId) -> bool {
        let mut queue = self.queue_state.queue.lock().await;
        let original_len = queue.len();
        queue.retain(|item| item.id != id);
        queue.len() < original_len
    }

    /// Number of jobs waiting for a worker slot
    pub async fn queued_len(&self) -> usize {
        self.queue_state.queue.lock().await.len()
    }
}

/// Reject requests that can never succeed before they enter the queue
pub(crate) fn validate_request(request: &ReleaseRequest, settings: &Settings) -> Result<()> {
    if !request.has_identity() {
        return Err(Error::InvalidRequest(
            "request needs a title or an external ID".to_string(),
        ));
    }

    let formats = if request.formats.is_empty() {
        &settings.filters.formats
    } else {
        &request.formats
    };
    if formats.iter().all(|f| f.trim().is_empty()) {
        return Err(Error::InvalidRequest(
            "request accepts no format".to_string(),
        ));
    }

    if let Some(subpath) = &request.destination_subpath
        && subpath
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::InvalidRequest(format!(
            "destination subpath '{}' must stay inside the ingest directory",
            subpath.display()
        )));
    }
    Ok(())
}
