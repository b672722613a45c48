//! Tool-Use Queue (§4.2): admits every tool-use block one assistant turn
//! requested, schedules them under the concurrency-safety policy, and drains
//! progress/results back to the Turn Loop in strict enqueue order.
//!
//! Scheduling policy: concurrency-safe entries run with no mutual exclusion;
//! a non-concurrency-safe entry requires exclusive execution (nothing else
//! may be running, and nothing else may start while it runs). Draining never
//! reorders — an entry still queued or executing blocks every later entry's
//! progress and result from being yielded, even if the later entry already
//! finished.
//!
//! Every entry checks its abort reason right before it would actually run:
//! a sibling that already errored wins over a plain cancellation signal, so
//! the next LLM turn gets the more specific "blocked by a failed sibling"
//! message instead of a generic rejection. An entry that is already being
//! driven runs to natural completion even after cancellation fires.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use ac_domain::cancel::CancelToken;
use ac_domain::capability::ToolUseBlock;
use ac_domain::context::{ContextModifier, ToolUseContext};
use ac_domain::message::{interrupt_messages, TurnMessage};
use ac_domain::trace::TraceEvent;

use super::invoker::{HookMeta, InvocationEvent, ToolInvoker};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EntryStatus {
    Queued,
    Executing,
    Completed,
    Yielded,
}

struct QueueEntry {
    block: ToolUseBlock,
    concurrency_safe: bool,
    status: Mutex<EntryStatus>,
    pending_progress: Mutex<Vec<TurnMessage>>,
    result: Mutex<Option<EntryResult>>,
    waiting_sent: Mutex<bool>,
}

struct EntryResult {
    message: TurnMessage,
    is_error: bool,
    context_modifier: Option<ContextModifier>,
    followups: Vec<TurnMessage>,
}

/// A single tool-use queue, seeded once from the assistant message that
/// requested these tool-use blocks and drained exactly once.
pub struct ToolUseQueue {
    invoker: Arc<ToolInvoker>,
    entries: Vec<Arc<QueueEntry>>,
    ctx: ToolUseContext,
    hook_meta: HookMeta,
    skip_permission: bool,
    cancel: CancelToken,
    notify: Arc<Notify>,
    inflight: AtomicUsize,
}

impl ToolUseQueue {
    /// `blocks` is the ordered list of tool-use blocks one assistant message
    /// produced. Concurrency-safety is resolved per block against the
    /// registered tool (an unknown tool name is treated as concurrency-safe
    /// so it can fail fast without blocking its siblings).
    pub fn new(
        invoker: Arc<ToolInvoker>,
        blocks: Vec<ToolUseBlock>,
        ctx: ToolUseContext,
        hook_meta: HookMeta,
        skip_permission: bool,
    ) -> Self {
        let entries = blocks
            .into_iter()
            .map(|block| {
                let concurrency_safe = invoker
                    .registry
                    .get(&block.name)
                    .map(|t| t.is_concurrency_safe(&block.input))
                    .unwrap_or(true);
                TraceEvent::ToolEnqueued {
                    tool_use_id: block.id.clone(),
                    tool_name: block.name.clone(),
                    concurrency_safe,
                }
                .emit();
                Arc::new(QueueEntry {
                    block,
                    concurrency_safe,
                    status: Mutex::new(EntryStatus::Queued),
                    pending_progress: Mutex::new(Vec::new()),
                    result: Mutex::new(None),
                    waiting_sent: Mutex::new(false),
                })
            })
            .collect();
        let cancel = ctx.cancel.clone();
        Self {
            invoker,
            entries,
            ctx,
            hook_meta,
            skip_permission,
            cancel,
            notify: Arc::new(Notify::new()),
            inflight: AtomicUsize::new(0),
        }
    }

    fn sibling_ids(&self, except: &str) -> Vec<String> {
        self.entries.iter().map(|e| e.block.id.clone()).filter(|id| id != except).collect()
    }

    /// Start every queued entry currently eligible to run, in enqueue
    /// order. Concurrency-safe entries start freely as long as nothing
    /// non-concurrency-safe is executing; a non-concurrency-safe entry may
    /// only start when nothing at all is executing, and claims exclusivity
    /// the moment it does.
    fn schedule(queue: &Arc<Self>) {
        let mut unsafe_running = queue
            .entries
            .iter()
            .any(|e| *e.status.lock() == EntryStatus::Executing && !e.concurrency_safe);
        let mut anything_running =
            queue.entries.iter().any(|e| *e.status.lock() == EntryStatus::Executing);

        for entry in &queue.entries {
            let mut status = entry.status.lock();
            if *status != EntryStatus::Queued {
                continue;
            }
            if unsafe_running {
                drop(status);
                Self::emit_waiting_once(queue, entry);
                continue;
            }
            if entry.concurrency_safe {
                *status = EntryStatus::Executing;
                drop(status);
                anything_running = true;
                Self::spawn_entry(queue, entry.clone());
            } else if !anything_running {
                *status = EntryStatus::Executing;
                drop(status);
                anything_running = true;
                unsafe_running = true;
                Self::spawn_entry(queue, entry.clone());
            } else {
                // Non-concurrency-safe entry blocked behind a running
                // concurrency-safe sibling: it needs the whole queue to
                // itself, so it waits too.
                drop(status);
                Self::emit_waiting_once(queue, entry);
            }
        }
    }

    /// Push a single "Waiting…" progress message onto `entry` the first
    /// time it is observed queued behind another entry's exclusive or
    /// blocking execution (§4.2, §8 scenario 2). Idempotent per entry.
    fn emit_waiting_once(queue: &Arc<Self>, entry: &Arc<QueueEntry>) {
        let mut sent = entry.waiting_sent.lock();
        if *sent {
            return;
        }
        *sent = true;
        drop(sent);
        let sibling_ids = queue.sibling_ids(&entry.block.id);
        entry.pending_progress.lock().push(TurnMessage::progress(
            entry.block.id.clone(),
            sibling_ids,
            interrupt_messages::WAITING_MESSAGE,
        ));
        queue.notify.notify_waiters();
    }

    fn spawn_entry(queue: &Arc<Self>, entry: Arc<QueueEntry>) {
        let queue = queue.clone();
        queue.inflight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            use futures_util::StreamExt;

            // A sibling that already errored (including one synthesized by
            // this same check) takes priority over a plain cancellation
            // signal: it gives the next LLM turn a more specific reason than
            // "rejected" for why this entry never ran.
            if queue.any_error() {
                queue.complete_synthetic(&entry, interrupt_messages::SIBLING_ERROR_MESSAGE, true);
                return;
            }
            if queue.cancel.is_cancelled() {
                queue.complete_synthetic(&entry, interrupt_messages::REJECT_MESSAGE, true);
                return;
            }

            let sibling_ids = queue.sibling_ids(&entry.block.id);
            let started = std::time::Instant::now();
            let mut stream = queue.invoker.clone().invoke(
                entry.block.clone(),
                queue.ctx.clone(),
                queue.hook_meta.clone(),
                queue.skip_permission,
                sibling_ids,
            );
            while let Some(event) = stream.next().await {
                match event {
                    InvocationEvent::Progress(msg) => {
                        entry.pending_progress.lock().push(msg);
                        queue.notify.notify_waiters();
                    }
                    InvocationEvent::Result { message, is_error, context_modifier, followups } => {
                        TraceEvent::ToolDispatched {
                            tool_use_id: entry.block.id.clone(),
                            tool_name: entry.block.name.clone(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            is_error,
                        }
                        .emit();
                        *entry.result.lock() = Some(EntryResult {
                            message,
                            is_error,
                            context_modifier,
                            followups,
                        });
                    }
                }
            }
            *entry.status.lock() = EntryStatus::Completed;
            queue.inflight.fetch_sub(1, Ordering::AcqRel);
            queue.notify.notify_waiters();
            Self::schedule(&queue);
        });
    }

    fn complete_synthetic(&self, entry: &Arc<QueueEntry>, text: &str, is_error: bool) {
        *entry.result.lock() = Some(EntryResult {
            message: TurnMessage::tool_result(entry.block.id.clone(), text.to_string(), is_error),
            is_error,
            context_modifier: None,
            followups: Vec::new(),
        });
        *entry.status.lock() = EntryStatus::Completed;
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn all_yielded(&self) -> bool {
        self.entries.iter().all(|e| *e.status.lock() == EntryStatus::Yielded)
    }

    /// Drain the queue: yields every progress message and tool-result in
    /// strict enqueue order, never skipping ahead of a still-running or
    /// still-queued earlier entry. Context-modifiers from completed entries
    /// are collected (in yield order) and exposed afterwards via
    /// [`Self::context_modifiers`].
    pub fn drain(self: Arc<Self>) -> Pin<Box<dyn Stream<Item = TurnMessage> + Send>> {
        Box::pin(async_stream::stream! {
            Self::schedule(&self);
            loop {
                let mut progressed = false;
                for entry in &self.entries {
                    let status = *entry.status.lock();
                    if status == EntryStatus::Yielded {
                        continue;
                    }
                    let next_progress = {
                        let mut pending = entry.pending_progress.lock();
                        if pending.is_empty() { None } else { Some(pending.remove(0)) }
                    };
                    if let Some(msg) = next_progress {
                        progressed = true;
                        yield msg;
                        continue;
                    }
                    if status == EntryStatus::Completed {
                        let message = entry.result.lock().as_ref().map(|r| r.message.clone());
                        if let Some(message) = message {
                            *entry.status.lock() = EntryStatus::Yielded;
                            progressed = true;
                            yield message;
                        }
                        continue;
                    }
                    // Still queued or executing with nothing pending: the
                    // barrier. Nothing after this entry may be yielded yet.
                    break;
                }

                if self.all_yielded() {
                    break;
                }
                if !progressed {
                    // Register interest before triggering anything that might
                    // notify us: `Notify::notified()` snapshots the current
                    // generation, so a `notify_waiters()` call anywhere after
                    // this point (even before the `.await` below is first
                    // polled) is still observed. Building the future after
                    // calling `schedule()` instead would risk a lost wakeup
                    // if a synthesized entry completes before we start waiting.
                    let notified = self.notify.notified();
                    // Cancellation may have left unstarted entries stuck
                    // (nothing running to notify us); re-run scheduling so
                    // they get synthesized instead of waiting forever.
                    if self.cancel.is_cancelled() {
                        Self::schedule(&self);
                    }
                    notified.await;
                }
            }
        })
    }

    /// Results the turn should carry forward even though they were never
    /// reached by `drain` — used only when the caller gives up on draining
    /// early (e.g. the whole queue was abandoned mid-turn). Normal
    /// completion drains every entry.
    pub fn get_remaining_results(&self) -> Vec<TurnMessage> {
        self.entries
            .iter()
            .filter_map(|e| {
                let status = *e.status.lock();
                if status == EntryStatus::Yielded {
                    None
                } else {
                    e.result.lock().as_ref().map(|r| r.message.clone())
                }
            })
            .collect()
    }

    /// Apply every completed entry's context-modifier to `ctx`, in enqueue
    /// order. Non-concurrency-safe entries never overlap another entry's
    /// execution, so their modifier is effectively already "immediate"; for
    /// concurrency-safe siblings that ran in parallel, enqueue order is the
    /// only well-defined tie-break the queue can offer, so that's what's
    /// used here (see `DESIGN.md`).
    pub fn get_updated_context(&self, ctx: &mut ToolUseContext) {
        for entry in &self.entries {
            let modifier = entry.result.lock().as_ref().and_then(|r| r.context_modifier.clone());
            if let Some(modifier) = modifier {
                modifier(ctx);
            }
        }
    }

    /// Every followup message emitted by hooks or tools while draining, in
    /// enqueue order.
    pub fn followups(&self) -> Vec<TurnMessage> {
        self.entries
            .iter()
            .filter_map(|e| e.result.lock().as_ref().map(|r| r.followups.clone()))
            .flatten()
            .collect()
    }

    /// Whether any entry's tool-result carried `is_error`.
    pub fn any_error(&self) -> bool {
        self.entries.iter().any(|e| e.result.lock().as_ref().map(|r| r.is_error).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_domain::capability::{ToolCapability, ToolEvent, ToolEventStream};
    use ac_domain::config::hooks::HooksConfig;
    use ac_domain::context::{PermissionMode, ToolUseContext, TurnOptions};
    use ac_domain::llm::{AssistantTurn, LlmAdapter, PermissionChecker, PermissionOutcome};
    use ac_domain::Result as AcResult;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    use super::super::hooks::HookRunner;
    use super::super::registry::ToolRegistry;

    /// Concurrency-safety is read per-call from `input.safe`, so one
    /// registered instance can back both safe and non-safe queue entries.
    struct EchoTool {
        delay_ms: u64,
        running: Arc<StdAtomicUsize>,
        max_concurrent: Arc<StdAtomicUsize>,
    }

    #[async_trait]
    impl ToolCapability for EchoTool {
        fn name(&self) -> &'static str {
            "Echo"
        }
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn is_concurrency_safe(&self, input: &Value) -> bool {
            input.get("safe").and_then(Value::as_bool).unwrap_or(false)
        }
        async fn validate_input(&self, _input: &Value, _ctx: &ToolUseContext) -> AcResult<()> {
            Ok(())
        }
        fn call(&self, _input: Value, _ctx: ToolUseContext) -> ToolEventStream {
            let running = self.running.clone();
            let max_concurrent = self.max_concurrent.clone();
            let delay_ms = self.delay_ms;
            Box::pin(async_stream::stream! {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                yield Ok(ToolEvent::ok(json!("done"), "done"));
            })
        }
    }

    struct AllowAll;
    #[async_trait]
    impl PermissionChecker for AllowAll {
        async fn check(&self, _tool: &str, _input: &Value, _id: &str, _ctx: &ToolUseContext) -> PermissionOutcome {
            PermissionOutcome::Allow
        }
    }

    struct NoopLlm;
    #[async_trait]
    impl LlmAdapter for NoopLlm {
        async fn query(
            &self,
            _history: &[ac_domain::tool::Message],
            _system_prompt: &[String],
            _max_thinking_tokens: Option<u32>,
            _tool_names: &[String],
            _ctx: &ToolUseContext,
        ) -> AcResult<AssistantTurn> {
            unimplemented!()
        }
        async fn query_quick(&self, _system: &str, _user: &str, _ctx: &ToolUseContext) -> AcResult<String> {
            Ok(String::new())
        }
    }

    fn ctx() -> ToolUseContext {
        ToolUseContext {
            options: TurnOptions {
                permission_mode: PermissionMode::BypassPermissions,
                ..TurnOptions::default()
            },
            ..ToolUseContext::new("main", "m1")
        }
    }

    fn hook_meta() -> HookMeta {
        HookMeta { session_id: "s".into(), transcript_path: "/tmp/t".into(), cwd: "/tmp".into() }
    }

    fn invoker(registry: ToolRegistry) -> Arc<ToolInvoker> {
        Arc::new(ToolInvoker {
            registry: Arc::new(registry),
            hooks: Arc::new(HookRunner::new(HooksConfig::default(), "/tmp".into())),
            permission: Arc::new(AllowAll),
            llm: Arc::new(NoopLlm),
        })
    }

    fn block(id: &str, safe: bool) -> ToolUseBlock {
        ToolUseBlock { id: id.into(), name: "Echo".into(), input: json!({ "safe": safe }) }
    }

    #[tokio::test]
    async fn concurrency_safe_siblings_run_in_parallel_and_yield_in_order() {
        let running = Arc::new(StdAtomicUsize::new(0));
        let max_concurrent = Arc::new(StdAtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool {
            delay_ms: 30,
            running: running.clone(),
            max_concurrent: max_concurrent.clone(),
        }));

        let queue = Arc::new(ToolUseQueue::new(
            invoker(reg),
            vec![block("t1", true), block("t2", true)],
            ctx(),
            hook_meta(),
            true,
        ));
        let results: Vec<_> = queue.drain().collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 2, "both should have overlapped");
    }

    #[tokio::test]
    async fn non_concurrency_safe_entry_blocks_the_safe_sibling_until_done() {
        let running = Arc::new(StdAtomicUsize::new(0));
        let max_concurrent = Arc::new(StdAtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool {
            delay_ms: 25,
            running: running.clone(),
            max_concurrent: max_concurrent.clone(),
        }));

        let queue = Arc::new(ToolUseQueue::new(
            invoker(reg),
            vec![block("unsafe1", false), block("safe1", true)],
            ctx(),
            hook_meta(),
            true,
        ));
        let results: Vec<_> = queue.drain().collect().await;
        // unsafe1's result, safe1's one-shot "Waiting…" progress, safe1's result.
        assert_eq!(results.len(), 3);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1, "must never overlap a non-safe entry");
    }

    #[tokio::test]
    async fn blocked_entry_emits_waiting_progress_exactly_once() {
        let running = Arc::new(StdAtomicUsize::new(0));
        let max_concurrent = Arc::new(StdAtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool {
            delay_ms: 25,
            running: running.clone(),
            max_concurrent: max_concurrent.clone(),
        }));

        let queue = Arc::new(ToolUseQueue::new(
            invoker(reg),
            vec![block("unsafe1", false), block("safe1", true)],
            ctx(),
            hook_meta(),
            true,
        ));
        let results: Vec<_> = queue.drain().collect().await;
        let waiting_count = results
            .iter()
            .filter(|msg| match msg {
                TurnMessage::Progress { display, .. } => {
                    format!("{display:?}").contains(interrupt_messages::WAITING_MESSAGE)
                }
                _ => false,
            })
            .count();
        assert_eq!(waiting_count, 1, "safe1 must see exactly one Waiting… progress message");
    }

    #[tokio::test]
    async fn cancelled_queue_synthesizes_reject_message_for_unstarted_entries() {
        let running = Arc::new(StdAtomicUsize::new(0));
        let max_concurrent = Arc::new(StdAtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool {
            delay_ms: 10,
            running: running.clone(),
            max_concurrent: max_concurrent.clone(),
        }));

        let c = ctx();
        c.cancel.cancel();
        let queue = Arc::new(ToolUseQueue::new(
            invoker(reg),
            vec![block("t1", false), block("t2", false)],
            c,
            hook_meta(),
            true,
        ));
        let results: Vec<_> = queue.drain().collect().await;
        // t1's reject result, t2's one-shot "Waiting…" progress (it is
        // queued behind t1's exclusive window), then t2's sibling-error
        // result once t1's rejection has already surfaced as an error.
        assert_eq!(results.len(), 3);
        let progress_count = results.iter().filter(|m| m.is_progress()).count();
        assert_eq!(progress_count, 1);
        // The first entry to hit the abort check has no errored sibling yet
        // and is rejected directly; the second sees the first's synthesized
        // error and gets the more specific sibling-error message instead.
        let texts: Vec<String> = results
            .iter()
            .filter(|m| !m.is_progress())
            .map(|msg| match msg {
                TurnMessage::User { content, .. } => format!("{content:?}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert!(texts[0].contains(interrupt_messages::REJECT_MESSAGE));
        assert!(texts[1].contains(interrupt_messages::SIBLING_ERROR_MESSAGE));
    }

    #[tokio::test]
    async fn a_real_tool_error_blocks_not_yet_started_siblings_without_cancellation() {
        struct FailingTool;
        #[async_trait]
        impl ToolCapability for FailingTool {
            fn name(&self) -> &'static str {
                "Fail"
            }
            fn input_schema(&self) -> Value {
                json!({})
            }
            fn is_concurrency_safe(&self, _input: &Value) -> bool {
                false
            }
            async fn validate_input(&self, _input: &Value, _ctx: &ToolUseContext) -> AcResult<()> {
                Ok(())
            }
            fn call(&self, _input: Value, _ctx: ToolUseContext) -> ToolEventStream {
                Box::pin(async_stream::stream! {
                    yield Err(ac_domain::Error::Other("boom".into()));
                })
            }
        }

        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FailingTool));

        let blocks = vec![
            ToolUseBlock { id: "t1".into(), name: "Fail".into(), input: json!({}) },
            ToolUseBlock { id: "t2".into(), name: "Fail".into(), input: json!({}) },
        ];
        let queue = Arc::new(ToolUseQueue::new(invoker(reg), blocks, ctx(), hook_meta(), true));
        let results: Vec<_> = queue.drain().collect().await;
        // t1's error result, t2's one-shot "Waiting…" progress, t2's
        // sibling-error result.
        assert_eq!(results.len(), 3);
        assert!(queue.any_error());
        let non_progress: Vec<&TurnMessage> = results.iter().filter(|m| !m.is_progress()).collect();
        assert_eq!(non_progress.len(), 2);
        let second = match non_progress[1] {
            TurnMessage::User { content, .. } => format!("{content:?}"),
            other => format!("{other:?}"),
        };
        assert!(second.contains(interrupt_messages::SIBLING_ERROR_MESSAGE));
    }
}
