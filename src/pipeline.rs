// SPDX-License-Identifier: MIT
//! Pipeline runner — wires the sync channel to the step machine and the
//! reconciliation store.
//!
//! Two independent consumer loops share the decoder's output: agent events
//! drive the lifecycle dispatch table, task mutations drive the store and,
//! when accepted, the notification dispatcher. Each mutable state object is
//! owned by exactly one loop; everything downstream reads published
//! snapshots. A full-refresh fetch from the authoritative backend runs when
//! the channel comes back online after reporting offline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth::TokenProvider;
use crate::backend::TaskBackend;
use crate::config::SyncConfig;
use crate::events::Event;
use crate::lifecycle::{dispatch, LifecycleView, StepMachine};
use crate::notify::{NotificationDispatcher, NotificationSink};
use crate::store::{ReconciliationStore, TaskCacheView};
use crate::sync::{ChannelHandles, ChannelState, TaskSyncChannel};

/// Read-only views onto the pipeline's published state.
pub struct PipelineViews {
    pub lifecycle: LifecycleView,
    pub tasks: TaskCacheView,
    pub channel_state: watch::Receiver<ChannelState>,
}

/// Requests pipeline teardown: closes the transport, cancels pending
/// reconnect timers, leaves applied state untouched.
///
/// Dropping the last handle also stops the pipeline.
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

pub struct Pipeline {
    channel: TaskSyncChannel,
    handles: ChannelHandles,
    machine: StepMachine,
    store: ReconciliationStore,
    dispatcher: NotificationDispatcher,
    backend: Arc<dyn TaskBackend>,
}

impl Pipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        config: &SyncConfig,
        token: Arc<dyn TokenProvider>,
        backend: Arc<dyn TaskBackend>,
        sink: Arc<dyn NotificationSink>,
    ) -> (Self, PipelineViews, StopHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (channel, handles) = TaskSyncChannel::new(
            config.stream_url.clone(),
            config.channel.clone(),
            token,
            stop_rx,
        );
        let machine = StepMachine::new();
        let store = ReconciliationStore::new();

        let views = PipelineViews {
            lifecycle: machine.view(),
            tasks: store.view(),
            channel_state: handles.state_rx.clone(),
        };

        (
            Self {
                channel,
                handles,
                machine,
                store,
                dispatcher: NotificationDispatcher::new(sink),
                backend,
            },
            views,
            StopHandle(Arc::new(stop_tx)),
        )
    }

    /// Run until stopped or the session ends. Events are consumed strictly
    /// in arrival order per branch; no two events' effects interleave.
    pub async fn run(self) -> anyhow::Result<()> {
        let Pipeline {
            channel,
            handles,
            mut machine,
            mut store,
            dispatcher,
            backend,
        } = self;
        let ChannelHandles {
            mut lifecycle_rx,
            mut mutation_rx,
            mut report_rx,
            mut state_rx,
        } = handles;

        let channel_task = tokio::spawn(channel.run());

        // Lifecycle branch: single writer of the step machine.
        let lifecycle_task = tokio::spawn(async move {
            while let Some(event) = lifecycle_rx.recv().await {
                // A new run starting after a finished one discards the old
                // progress list; a mid-run agent_start (sub-agent) appends.
                if matches!(event, Event::AgentStart { .. }) && machine.run_finished() {
                    machine.reset();
                }
                dispatch(&mut machine, &event);
            }
        });

        // Mutation branch: single writer of the store. The same task also
        // performs the refresh-after-offline fetch, so a refresh can never
        // interleave with an event's application.
        let mutation_task = tokio::spawn(async move {
            let mut was_offline = false;
            let mut state_alive = true;
            loop {
                tokio::select! {
                    maybe = mutation_rx.recv() => {
                        let Some(mutation) = maybe else { break };
                        if let Some(kind) = store.apply(&mutation).accepted() {
                            dispatcher.notify(kind, &mutation.task);
                        }
                    }
                    changed = state_rx.changed(), if state_alive => {
                        if changed.is_err() {
                            state_alive = false;
                            continue;
                        }
                        let state = *state_rx.borrow_and_update();
                        match state {
                            ChannelState::Offline => was_offline = true,
                            ChannelState::Online if was_offline => {
                                was_offline = false;
                                info!("back online after extended disconnection — refreshing task cache");
                                match backend.list_tasks().await {
                                    Ok(tasks) => store.refresh(tasks),
                                    Err(err) => {
                                        // Keep the stale cache; the next
                                        // offline/online cycle retries.
                                        error!(err = %err, "task cache refresh failed");
                                        was_offline = true;
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        // Skipped frames: already counted out of the stream by the decoder,
        // surfaced here for the log.
        let report_task = tokio::spawn(async move {
            while let Some(report) = report_rx.recv().await {
                warn!(reason = %report.reason, frame = %report.frame, "frame skipped");
            }
        });

        let (channel_res, lifecycle_res, mutation_res, report_res) =
            tokio::join!(channel_task, lifecycle_task, mutation_task, report_task);
        for res in [channel_res, lifecycle_res, mutation_res, report_res] {
            if let Err(e) = res {
                error!(err = %e, "pipeline task panicked");
            }
        }

        info!("pipeline stopped");
        Ok(())
    }
}
