use log::{debug, error, warn};
use serde_json::{json, Map, Value};

use crate::api::{Actor, Api, ApiError, Role};
use crate::clock::Clock;

/// Rapid interactions (dragging a timer, bumping a score) collapse into
/// one network write per window.
pub const DEBOUNCE_MS: i64 = 300;
/// Bounded staleness for observers: at worst one interval behind.
pub const POLL_INTERVAL_MS: i64 = 2000;

const RETRY_BASE_MS: i64 = 500;
const RETRY_CAP_MS: i64 = 30_000;

pub fn backoff_delay_ms(attempt: u32) -> i64 {
    let shift = attempt.min(10);
    (RETRY_BASE_MS << shift).min(RETRY_CAP_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Everything applied locally has been acknowledged by the server.
    Synced,
    /// A debounced write is scheduled but has not been sent yet.
    Dirty,
    /// At least one send failed; the payload is held for backoff retry.
    Retrying { attempt: u32 },
}

/// One coalescing write slot: a new schedule replaces the payload and
/// pushes the deadline out, it never queues a second write.
#[derive(Debug)]
pub struct Debounced<T> {
    debounce_ms: i64,
    pending: Option<Pending<T>>,
}

#[derive(Debug)]
struct Pending<T> {
    payload: T,
    due_at: i64,
    attempt: u32,
}

impl<T> Debounced<T> {
    pub fn new(debounce_ms: i64) -> Self {
        Self {
            debounce_ms,
            pending: None,
        }
    }

    pub fn schedule(&mut self, payload: T, now_ms: i64) {
        self.pending = Some(Pending {
            payload,
            due_at: now_ms + self.debounce_ms,
            attempt: 0,
        });
    }

    /// Removes and returns the payload once its deadline has passed.
    pub fn take_due(&mut self, now_ms: i64) -> Option<(T, u32)> {
        if self.pending.as_ref().is_some_and(|p| now_ms >= p.due_at) {
            self.pending.take().map(|p| (p.payload, p.attempt))
        } else {
            None
        }
    }

    /// Removes and returns the payload regardless of deadline.
    pub fn take_now(&mut self) -> Option<(T, u32)> {
        self.pending.take().map(|p| (p.payload, p.attempt))
    }

    /// Puts a failed payload back with an exponential-backoff deadline,
    /// unless a newer schedule already took the slot.
    pub fn put_back_failed(&mut self, payload: T, failed_attempt: u32, now_ms: i64) {
        if self.pending.is_some() {
            return;
        }
        let attempt = failed_attempt + 1;
        self.pending = Some(Pending {
            payload,
            due_at: now_ms + backoff_delay_ms(failed_attempt),
            attempt,
        });
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn attempt(&self) -> u32 {
        self.pending.as_ref().map(|p| p.attempt).unwrap_or(0)
    }
}

/// Client side of the per-room shared state blob.
///
/// Single-writer-many-reader: the teacher client is the only mutator, all
/// student clients observe via changed-since polls. The caller drives
/// `tick()` from its timer loop; every deadline in here (debounce, retry
/// backoff, next poll) is a comparison against the injected clock, so the
/// channel itself owns no timers and dropping it cancels everything, e.g.
/// on a room switch.
pub struct SharedStateChannel<A: Api, C: Clock> {
    api: A,
    clock: C,
    room_id: String,
    actor: Actor,
    blob: Map<String, Value>,
    last_updated_at: i64,
    pending: Debounced<Map<String, Value>>,
    next_poll_at: i64,
}

impl<A: Api, C: Clock> SharedStateChannel<A, C> {
    pub fn new(api: A, clock: C, room_id: &str, actor: Actor) -> Self {
        let now = clock.now_ms();
        Self {
            api,
            clock,
            room_id: room_id.to_string(),
            actor,
            blob: Map::new(),
            last_updated_at: 0,
            pending: Debounced::new(DEBOUNCE_MS),
            next_poll_at: now,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn blob(&self) -> &Map<String, Value> {
        &self.blob
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.blob.get(key)
    }

    pub fn last_updated_at(&self) -> i64 {
        self.last_updated_at
    }

    pub fn status(&self) -> SyncStatus {
        match self.pending.attempt() {
            0 if !self.pending.is_pending() => SyncStatus::Synced,
            0 => SyncStatus::Dirty,
            attempt => SyncStatus::Retrying { attempt },
        }
    }

    /// Initial fetch, used by both roles when entering a room. A transient
    /// failure leaves the (empty) local view in place; the next poll or
    /// write retries.
    pub fn load(&mut self) -> Result<(), ApiError> {
        let result = self
            .api
            .call("state.get", json!({ "roomId": self.room_id }))?;
        self.apply_snapshot(&result);
        Ok(())
    }

    /// The single write gate. Only the teacher role ever mutates the blob
    /// or reaches the network; for everyone else this is a no-op and
    /// returns false, which is what gives every tool read-only student
    /// semantics without per-call-site checks.
    pub fn set_key(&mut self, key: &str, value: Value) -> bool {
        if self.actor.role != Role::Teacher {
            return false;
        }
        self.blob.insert(key.to_string(), value);
        self.schedule_write();
        true
    }

    pub fn remove_key(&mut self, key: &str) -> bool {
        if self.actor.role != Role::Teacher {
            return false;
        }
        self.blob.remove(key);
        self.schedule_write();
        true
    }

    fn schedule_write(&mut self) {
        let snapshot = self.blob.clone();
        let now = self.clock.now_ms();
        self.pending.schedule(snapshot, now);
    }

    /// Drives debounced writes, retries and polling. Call on every timer
    /// tick; sub-interval tick rates are fine, deadlines gate the work.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        if let Some((payload, attempt)) = self.pending.take_due(now) {
            self.send_write(payload, attempt);
        }
        if self.actor.role != Role::Teacher && now >= self.next_poll_at {
            self.poll();
        }
    }

    /// Sends any scheduled write immediately, skipping the remaining
    /// debounce delay. Used where losing the write window matters more
    /// than coalescing, e.g. quiz session transitions.
    pub fn flush(&mut self) {
        if let Some((payload, attempt)) = self.pending.take_now() {
            self.send_write(payload, attempt);
        }
    }

    fn send_write(&mut self, payload: Map<String, Value>, attempt: u32) {
        let result = self.api.call(
            "state.put",
            json!({
                "roomId": self.room_id,
                "state": Value::Object(payload.clone()),
                "actor": self.actor.to_json(),
            }),
        );
        match result {
            Ok(resp) => {
                if let Some(updated_at) = resp.get("updatedAt").and_then(|v| v.as_i64()) {
                    self.last_updated_at = updated_at;
                }
            }
            Err(ApiError::Transient(m)) => {
                let now = self.clock.now_ms();
                warn!(
                    "state write for room {} failed (attempt {}): {}",
                    self.room_id, attempt, m
                );
                self.pending.put_back_failed(payload, attempt, now);
            }
            Err(e @ ApiError::Rejected { .. }) => {
                // The server refused the write outright; retrying the same
                // payload cannot succeed. Local state now diverges until
                // the next authoritative read.
                error!("state write for room {} rejected: {}", self.room_id, e);
            }
        }
    }

    /// Changed-since read. No payload is transferred (and nothing local
    /// is touched) when the server has nothing newer; a transient failure
    /// keeps the stale cache indefinitely.
    pub fn poll(&mut self) {
        self.next_poll_at = self.clock.now_ms() + POLL_INTERVAL_MS;
        let result = self.api.call(
            "state.get",
            json!({ "roomId": self.room_id, "since": self.last_updated_at }),
        );
        match result {
            Ok(resp) => {
                if resp.get("changed").and_then(|v| v.as_bool()) == Some(true) {
                    self.apply_snapshot(&resp);
                }
            }
            Err(e) => {
                debug!("state poll for room {} failed: {}", self.room_id, e);
            }
        }
    }

    fn apply_snapshot(&mut self, resp: &Value) {
        if let Some(obj) = resp.get("state").and_then(|v| v.as_object()) {
            self.blob = obj.clone();
        }
        if let Some(updated_at) = resp.get("updatedAt").and_then(|v| v.as_i64()) {
            self.last_updated_at = updated_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Scriptable in-memory server: records puts, serves gets from the
    /// last accepted blob, and can be told to fail the next N calls.
    #[derive(Clone, Default)]
    struct ScriptedApi {
        inner: Rc<RefCell<ScriptedInner>>,
    }

    #[derive(Default)]
    struct ScriptedInner {
        puts: Vec<Value>,
        state: Option<Value>,
        updated_at: i64,
        fail_next: u32,
        get_count: u32,
    }

    impl ScriptedApi {
        fn put_count(&self) -> usize {
            self.inner.borrow().puts.len()
        }

        fn last_put_state(&self) -> Value {
            self.inner
                .borrow()
                .puts
                .last()
                .and_then(|p| p.get("state").cloned())
                .expect("at least one put")
        }

        fn fail_next(&self, n: u32) {
            self.inner.borrow_mut().fail_next = n;
        }
    }

    impl Api for ScriptedApi {
        fn call(&mut self, method: &str, params: Value) -> Result<Value, ApiError> {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                return Err(ApiError::Transient("connection refused".to_string()));
            }
            match method {
                "state.put" => {
                    inner.updated_at += 1;
                    inner.state = params.get("state").cloned();
                    inner.puts.push(params);
                    Ok(json!({ "updatedAt": inner.updated_at }))
                }
                "state.get" => {
                    inner.get_count += 1;
                    let since = params.get("since").and_then(|v| v.as_i64());
                    if let Some(since) = since {
                        if inner.updated_at <= since {
                            return Ok(json!({ "changed": false }));
                        }
                    }
                    Ok(json!({
                        "changed": true,
                        "state": inner.state.clone().unwrap_or_else(|| json!({})),
                        "updatedAt": inner.updated_at,
                    }))
                }
                other => panic!("unexpected method {}", other),
            }
        }
    }

    fn teacher_channel(
        api: &ScriptedApi,
        clock: &ManualClock,
    ) -> SharedStateChannel<ScriptedApi, ManualClock> {
        SharedStateChannel::new(
            api.clone(),
            clock.clone(),
            "room-1",
            Actor::teacher("t1", "Teacher"),
        )
    }

    fn student_channel(
        api: &ScriptedApi,
        clock: &ManualClock,
    ) -> SharedStateChannel<ScriptedApi, ManualClock> {
        SharedStateChannel::new(
            api.clone(),
            clock.clone(),
            "room-1",
            Actor::student("s1", "Student"),
        )
    }

    #[test]
    fn student_set_key_never_mutates_or_writes() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut ch = student_channel(&api, &clock);

        assert!(!ch.set_key("dice", json!([4])));
        assert!(!ch.remove_key("dice"));
        assert!(ch.blob().is_empty());
        assert_eq!(ch.status(), SyncStatus::Synced);

        clock.advance(10 * DEBOUNCE_MS);
        ch.tick();
        assert_eq!(api.put_count(), 0);
    }

    #[test]
    fn writes_within_window_coalesce_to_last_value() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut ch = teacher_channel(&api, &clock);

        ch.set_key("dice", json!([1]));
        clock.advance(100);
        ch.tick();
        ch.set_key("dice", json!([3]));
        clock.advance(100);
        ch.tick();
        ch.set_key("dice", json!([6]));
        assert_eq!(api.put_count(), 0);
        assert_eq!(ch.status(), SyncStatus::Dirty);

        clock.advance(DEBOUNCE_MS);
        ch.tick();
        assert_eq!(api.put_count(), 1);
        assert_eq!(api.last_put_state(), json!({ "dice": [6] }));
        assert_eq!(ch.status(), SyncStatus::Synced);
    }

    #[test]
    fn optimistic_apply_is_immediate() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut ch = teacher_channel(&api, &clock);

        ch.set_key("scoreboard", json!({ "red": 2 }));
        assert_eq!(ch.get("scoreboard"), Some(&json!({ "red": 2 })));
        assert_eq!(api.put_count(), 0);
    }

    #[test]
    fn failed_write_retries_with_backoff_until_acked() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut ch = teacher_channel(&api, &clock);

        api.fail_next(2);
        ch.set_key("timer", json!({ "durationSecs": 60 }));
        clock.advance(DEBOUNCE_MS);
        ch.tick();
        assert_eq!(api.put_count(), 0);
        assert_eq!(ch.status(), SyncStatus::Retrying { attempt: 1 });

        // First retry also fails, backoff doubles.
        clock.advance(backoff_delay_ms(0));
        ch.tick();
        assert_eq!(ch.status(), SyncStatus::Retrying { attempt: 2 });

        // Not due yet: half the second backoff window.
        clock.advance(backoff_delay_ms(1) / 2);
        ch.tick();
        assert_eq!(ch.status(), SyncStatus::Retrying { attempt: 2 });

        clock.advance(backoff_delay_ms(1));
        ch.tick();
        assert_eq!(api.put_count(), 1);
        assert_eq!(ch.status(), SyncStatus::Synced);
        assert_eq!(api.last_put_state(), json!({ "timer": { "durationSecs": 60 } }));
    }

    #[test]
    fn newer_write_supersedes_failed_payload() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut ch = teacher_channel(&api, &clock);

        api.fail_next(1);
        ch.set_key("dice", json!([2]));
        clock.advance(DEBOUNCE_MS);
        ch.tick();
        assert_eq!(ch.status(), SyncStatus::Retrying { attempt: 1 });

        ch.set_key("dice", json!([5]));
        clock.advance(backoff_delay_ms(1));
        ch.tick();
        assert_eq!(api.put_count(), 1);
        assert_eq!(api.last_put_state(), json!({ "dice": [5] }));
    }

    #[test]
    fn flush_skips_remaining_debounce_delay() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut ch = teacher_channel(&api, &clock);

        ch.set_key("quiz-session", json!({ "status": "active" }));
        ch.flush();
        assert_eq!(api.put_count(), 1);
        assert_eq!(ch.status(), SyncStatus::Synced);
    }

    #[test]
    fn poll_is_idempotent_without_intervening_write() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut teacher = teacher_channel(&api, &clock);
        let mut student = student_channel(&api, &clock);

        teacher.set_key("dice", json!([4]));
        teacher.flush();

        student.poll();
        assert_eq!(student.get("dice"), Some(&json!([4])));
        let seen_at = student.last_updated_at();

        student.poll();
        assert_eq!(student.last_updated_at(), seen_at);
        assert_eq!(student.get("dice"), Some(&json!([4])));
    }

    #[test]
    fn poll_interval_gates_ticks() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut student = student_channel(&api, &clock);

        // Tick every 100ms across two poll intervals: one poll fires
        // immediately, then one per elapsed interval.
        for _ in 0..=(2 * POLL_INTERVAL_MS / 100) {
            student.tick();
            clock.advance(100);
        }
        assert_eq!(api.inner.borrow().get_count, 3);
    }

    #[test]
    fn failed_poll_keeps_stale_cache() {
        let api = ScriptedApi::default();
        let clock = ManualClock::new(0);
        let mut teacher = teacher_channel(&api, &clock);
        let mut student = student_channel(&api, &clock);

        teacher.set_key("dice", json!([6]));
        teacher.flush();
        student.poll();
        assert_eq!(student.get("dice"), Some(&json!([6])));

        teacher.set_key("dice", json!([1]));
        teacher.flush();
        api.fail_next(1);
        student.poll();
        // Network down: last-known value survives untouched.
        assert_eq!(student.get("dice"), Some(&json!([6])));

        student.poll();
        assert_eq!(student.get("dice"), Some(&json!([1])));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay_ms(0), 500);
        assert_eq!(backoff_delay_ms(1), 1000);
        assert_eq!(backoff_delay_ms(2), 2000);
        assert_eq!(backoff_delay_ms(20), 30_000);
    }
}
