//! Test doubles for the node lifecycle.
//!
//! `FakeProvider` records every call and can be told to fail at a chosen
//! step; `FakeTrustStore` records registrations and answers pings from a
//! script. Both write to a shared [`Journal`] so tests can assert ordering
//! across them.

use std::collections::VecDeque;
use std::future::pending;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use camino::Utf8PathBuf;
use hart::exec::CommandRunner;
use hart::lifecycle::InterruptTrigger;
use hart::provider::{
    CreateRequest, NodeSize, NodeSpec, Provider, ProviderError, ProviderExtra, ProviderFuture,
    ProvisionedNode, Region, RemoteKey, ResourceHandle,
};
use hart::ssh::{LocalKeyPair, SshSession};
use hart::trust::{TrustError, TrustFuture, TrustStore};

/// Ordered record of calls made to the doubles.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    fn push(&self, entry: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|err| panic!("journal lock poisoned: {err}"))
            .push(entry.to_owned());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|err| panic!("journal lock poisoned: {err}"))
            .clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|seen| *seen == entry).count()
    }
}

/// Steps a [`FakeProvider`] can be told to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailAt {
    Create,
    Resolve,
    ResolveTimeout,
    Bootstrap,
    PostConnect,
    Destroy,
    Find,
}

#[derive(Debug, Default)]
struct ProviderState {
    failures: Vec<FailAt>,
    destroyed: Vec<(ResourceHandle, ProviderExtra)>,
    user_data: Option<String>,
    interrupt_after_create: Option<InterruptTrigger>,
    interrupt_during_bootstrap: Option<InterruptTrigger>,
}

#[derive(Clone, Debug)]
pub struct FakeProvider {
    journal: Journal,
    state: Arc<Mutex<ProviderState>>,
}

pub const RESOURCE_ID: &str = "res-1";
pub const EXTRA: &str = "aux-1";
pub const ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));

impl FakeProvider {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("fake provider lock poisoned: {err}"))
    }

    pub fn fail_at(&self, step: FailAt) {
        self.lock().failures.push(step);
    }

    fn fails(&self, step: FailAt) -> bool {
        self.lock().failures.contains(&step)
    }

    /// Raises `trigger` once the creation call has returned.
    pub fn interrupt_after_create(&self, trigger: InterruptTrigger) {
        self.lock().interrupt_after_create = Some(trigger);
    }

    /// Raises `trigger` while the bootstrap wait is in flight, which then
    /// never completes on its own.
    pub fn interrupt_during_bootstrap(&self, trigger: InterruptTrigger) {
        self.lock().interrupt_during_bootstrap = Some(trigger);
    }

    fn record(&self, call: &str) {
        self.journal.push(call);
    }

    pub fn destroyed(&self) -> Vec<(ResourceHandle, ProviderExtra)> {
        self.lock().destroyed.clone()
    }

    pub fn user_data(&self) -> Option<String> {
        self.lock().user_data.clone()
    }

    fn handle() -> ResourceHandle {
        ResourceHandle {
            id: String::from(RESOURCE_ID),
            name: String::from("web.example.com"),
            region: Some(String::from("test-1")),
        }
    }
}

fn scripted_failure(step: &str) -> ProviderError {
    ProviderError::Api {
        operation: step.to_owned(),
        message: String::from("scripted failure"),
    }
}

impl Provider for FakeProvider {
    fn alias(&self) -> &'static str {
        "fake"
    }

    fn validate(&self, spec: &NodeSpec) -> Result<(), ProviderError> {
        if spec.region.is_none() {
            return Err(ProviderError::Config(String::from("a region is required")));
        }
        Ok(())
    }

    fn register_key<'a>(
        &'a self,
        name: &'a str,
        _key: &'a LocalKeyPair,
    ) -> ProviderFuture<'a, RemoteKey> {
        Box::pin(async move {
            self.record("register_key");
            Ok(RemoteKey::Registered {
                id: String::from("key-1"),
                name: name.to_owned(),
            })
        })
    }

    fn release_key(&self, _key: RemoteKey) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            self.record("release_key");
            Ok(())
        })
    }

    fn create_resource<'a>(
        &'a self,
        request: &'a CreateRequest<'a>,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            self.record("create");
            self.lock().user_data = Some(request.user_data.to_owned());
            if self.fails(FailAt::Create) {
                return Err(scripted_failure("create"));
            }
            if let Some(trigger) = &self.lock().interrupt_after_create {
                trigger.trigger();
            }
            Ok((Self::handle(), ProviderExtra::new(EXTRA)))
        })
    }

    fn resolve_public_address<'a>(
        &'a self,
        _handle: &'a ResourceHandle,
    ) -> ProviderFuture<'a, IpAddr> {
        Box::pin(async move {
            self.record("resolve");
            if self.fails(FailAt::ResolveTimeout) {
                return Err(ProviderError::Timeout {
                    what: String::from("a public address"),
                    after: Duration::from_secs(180),
                });
            }
            if self.fails(FailAt::Resolve) {
                return Err(scripted_failure("resolve"));
            }
            Ok(ADDRESS)
        })
    }

    fn destroy_resource<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("destroy");
            self.lock().destroyed.push((handle.clone(), extra.clone()));
            if self.fails(FailAt::Destroy) {
                return Err(scripted_failure("destroy"));
            }
            Ok(())
        })
    }

    fn find_resource<'a>(
        &'a self,
        minion_id: &'a str,
    ) -> ProviderFuture<'a, (ResourceHandle, ProviderExtra)> {
        Box::pin(async move {
            self.record("find");
            if self.fails(FailAt::Find) {
                return Err(ProviderError::NotFound {
                    kind: String::from("resource"),
                    name: minion_id.to_owned(),
                });
            }
            Ok((Self::handle(), ProviderExtra::new(EXTRA)))
        })
    }

    fn wait_for_bootstrap<'a, R: CommandRunner + 'a>(
        &'a self,
        _session: &'a mut SshSession<R>,
        _extra: &'a ProviderExtra,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("wait_for_bootstrap");
            let raised = self
                .lock()
                .interrupt_during_bootstrap
                .as_ref()
                .inspect(|trigger| trigger.trigger())
                .is_some();
            if raised {
                pending::<()>().await;
            }
            if self.fails(FailAt::Bootstrap) {
                return Err(ProviderError::BootstrapFailed {
                    detail: String::from("E: Unable to locate package salt-minion"),
                });
            }
            Ok(())
        })
    }

    fn on_post_connect<'a, R: CommandRunner + 'a>(
        &'a self,
        _node: &'a ProvisionedNode,
        _session: &'a mut SshSession<R>,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("post_connect");
            if self.fails(FailAt::PostConnect) {
                return Err(scripted_failure("post-connect"));
            }
            Ok(())
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<NodeSize>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn list_regions(&self, _include_zones: bool) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[derive(Debug, Default)]
struct TrustState {
    registered: Vec<(String, String)>,
    pings: VecDeque<Result<(), TrustError>>,
    fail_register: bool,
    fail_deregister: bool,
}

#[derive(Clone, Debug)]
pub struct FakeTrustStore {
    journal: Journal,
    state: Arc<Mutex<TrustState>>,
}

pub const MASTER_PUBKEY: &str = "MASTER-PUBLIC-KEY";

impl FakeTrustStore {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrustState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("fake trust store lock poisoned: {err}"))
    }

    /// Queues ping answers; once exhausted every ping succeeds.
    pub fn script_pings(&self, answers: impl IntoIterator<Item = Result<(), TrustError>>) {
        self.lock().pings.extend(answers);
    }

    /// Makes `register` fail after the key file has been written.
    pub fn fail_register(&self) {
        self.lock().fail_register = true;
    }

    pub fn fail_deregister(&self) {
        self.lock().fail_deregister = true;
    }

    pub fn registered(&self) -> Vec<(String, String)> {
        self.lock().registered.clone()
    }
}

pub fn not_connected() -> TrustError {
    TrustError::NotConnected {
        minion_id: String::from("web.example.com"),
    }
}

impl TrustStore for FakeTrustStore {
    fn master_pubkey(&self) -> TrustFuture<'_, String> {
        Box::pin(async { Ok(String::from(MASTER_PUBKEY)) })
    }

    fn register<'a>(&'a self, minion_id: &'a str, public_key: &'a str) -> TrustFuture<'a, ()> {
        Box::pin(async move {
            self.journal.push("register");
            let mut state = self.lock();
            state
                .registered
                .push((minion_id.to_owned(), public_key.to_owned()));
            if state.fail_register {
                return Err(TrustError::Io {
                    path: Utf8PathBuf::from(format!(
                        "/etc/salt/pki/master/minions/{minion_id}"
                    )),
                    message: String::from("permission denied"),
                });
            }
            Ok(())
        })
    }

    fn deregister<'a>(&'a self, _minion_id: &'a str) -> TrustFuture<'a, ()> {
        Box::pin(async move {
            self.journal.push("deregister");
            if self.lock().fail_deregister {
                return Err(TrustError::Command {
                    command: String::from("salt-key --yes --delete web.example.com"),
                    status: String::from("1"),
                    stderr: String::from("permission denied"),
                });
            }
            Ok(())
        })
    }

    fn ping<'a>(&'a self, _minion_id: &'a str) -> TrustFuture<'a, ()> {
        Box::pin(async move {
            self.journal.push("ping");
            self.lock().pings.pop_front().unwrap_or(Ok(()))
        })
    }
}
