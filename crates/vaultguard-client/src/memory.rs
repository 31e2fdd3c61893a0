//! An in-process policy engine for tests and local runs.
//!
//! Relations are evaluated against stored tuples plus a small table of implied
//! relations (`owner` implies `admin`, `admin` implies `manage`, ...), and
//! group usersets such as `group:eng#member` are expanded. Failures and
//! latency can be scripted to exercise the client's error paths.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use vaultguard_core::engine::{CheckRequest, CheckResponse, EngineError, ListObjectsRequest};
use vaultguard_core::identifier::parse_object;
use vaultguard_core::{PolicyEngine, Tuple};

const MAX_DEPTH: usize = 8;

/// `(object type, relation, implied by)` triples of the default model.
const DEFAULT_MODEL: &[(&str, &str, &[&str])] = &[
    ("vault", "admin", &["owner"]),
    ("vault", "editor", &["admin"]),
    ("vault", "viewer", &["editor"]),
    ("vault", "view", &["viewer"]),
    ("vault", "edit", &["editor"]),
    ("vault", "delete", &["admin"]),
    ("vault", "manage", &["admin"]),
    ("vault", "share", &["admin"]),
    ("secret", "editor", &["owner"]),
    ("secret", "viewer", &["editor"]),
    ("secret", "read", &["viewer"]),
    ("secret", "write", &["editor"]),
    ("secret", "delete", &["owner"]),
    ("secret", "manage", &["owner"]),
    ("tenant", "admin", &["owner"]),
    ("tenant", "member", &["admin"]),
    ("tenant", "view", &["member"]),
    ("tenant", "manage", &["admin"]),
    ("tenant", "create_vault", &["admin"]),
    ("tenant", "manage_members", &["admin"]),
    ("tenant", "manage_billing", &["owner"]),
    ("group", "admin", &["owner"]),
    ("group", "member", &["admin"]),
    ("group", "view", &["member"]),
    ("group", "manage", &["admin"]),
    ("group", "manage_members", &["admin"]),
    ("token", "view", &["owner"]),
    ("token", "use", &["owner"]),
    ("token", "revoke", &["owner"]),
    ("token", "manage", &["owner"]),
];

#[derive(Debug, Default)]
struct State {
    tuples: HashSet<Tuple>,
    implied: HashMap<(String, String), Vec<String>>,
    scripted_failures: VecDeque<EngineError>,
    persistent_failure: Option<EngineError>,
    delay: Duration,
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyEngine {
    state: Mutex<State>,
    check_calls: AtomicUsize,
    list_calls: AtomicUsize,
    write_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryPolicyEngine {
    /// An engine with no implied relations: only exact tuples match.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_model() -> Self {
        let engine = Self::default();
        {
            let mut state = engine.lock();
            for (object_type, relation, implied_by) in DEFAULT_MODEL {
                state.implied.insert(
                    (object_type.to_string(), relation.to_string()),
                    implied_by.iter().map(|r| r.to_string()).collect(),
                );
            }
        }
        engine
    }

    /// Inserts tuples directly, bypassing call accounting and scripted failures.
    pub fn seed(&self, tuples: impl IntoIterator<Item = Tuple>) {
        self.lock().tuples.extend(tuples);
    }

    pub fn tuples(&self) -> Vec<Tuple> {
        let mut tuples: Vec<_> = self.lock().tuples.iter().cloned().collect();
        tuples.sort_by_key(|t| t.to_string());
        tuples
    }

    pub fn contains(&self, tuple: &Tuple) -> bool {
        self.lock().tuples.contains(tuple)
    }

    /// The next call of any kind fails with `err`.
    pub fn fail_next(&self, err: EngineError) {
        self.lock().scripted_failures.push_back(err);
    }

    /// Every call fails with `err` until cleared with `None`.
    pub fn set_failure(&self, err: Option<EngineError>) {
        self.lock().persistent_failure = err;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, calls: &AtomicUsize) -> InFlight<'_> {
        calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight {
            counter: &self.in_flight,
        }
    }

    async fn simulate(&self) -> Result<(), EngineError> {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        match &state.persistent_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn evaluate(state: &State, user: &str, relation: &str, object: &str, depth: usize) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        if state
            .tuples
            .contains(&Tuple::new(user, relation, object))
        {
            return true;
        }

        let via_userset = state.tuples.iter().any(|t| {
            t.object == object
                && t.relation == relation
                && t.user
                    .split_once('#')
                    .is_some_and(|(set, set_relation)| {
                        Self::evaluate(state, user, set_relation, set, depth + 1)
                    })
        });
        if via_userset {
            return true;
        }

        let Ok((object_type, _)) = parse_object(object) else {
            return false;
        };
        state
            .implied
            .get(&(object_type.to_string(), relation.to_string()))
            .is_some_and(|implied_by| {
                implied_by
                    .iter()
                    .any(|r| Self::evaluate(state, user, r, object, depth + 1))
            })
    }
}

impl PolicyEngine for InMemoryPolicyEngine {
    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse, EngineError> {
        let _in_flight = self.enter(&self.check_calls);
        self.simulate().await?;
        let state = self.lock();
        let allowed = Self::evaluate(&state, &request.user, &request.relation, &request.object, 0);
        Ok(CheckResponse { allowed })
    }

    async fn list_objects(&self, request: &ListObjectsRequest) -> Result<Vec<String>, EngineError> {
        let _in_flight = self.enter(&self.list_calls);
        self.simulate().await?;
        let state = self.lock();
        let candidates: BTreeSet<&str> = state
            .tuples
            .iter()
            .map(|t| t.object.as_str())
            .filter(|object| {
                parse_object(object).is_ok_and(|(object_type, _)| object_type == request.object_type)
            })
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|object| Self::evaluate(&state, &request.user, &request.relation, object, 0))
            .map(str::to_string)
            .collect())
    }

    async fn write_tuples(&self, tuples: &[Tuple]) -> Result<(), EngineError> {
        let _in_flight = self.enter(&self.write_calls);
        self.simulate().await?;
        self.lock().tuples.extend(tuples.iter().cloned());
        Ok(())
    }

    async fn delete_tuples(&self, tuples: &[Tuple]) -> Result<(), EngineError> {
        let _in_flight = self.enter(&self.delete_calls);
        self.simulate().await?;
        let mut state = self.lock();
        for tuple in tuples {
            state.tuples.remove(tuple);
        }
        Ok(())
    }
}
