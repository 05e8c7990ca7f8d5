//! The routing core: request classification, dispatch fan-out, timeouts.
//!
//! The server processes one ingest event (request, publish, tick) to
//! completion before the next; concurrency across clients lives in the
//! transport layer, which serialises events into this core. No operation
//! here suspends, so no locking is needed.
//!
//! External collaborators (schema lookup, revision assignment, the client
//! and peer transports, the time source) are passed in at construction.

use std::collections::BTreeSet;
use std::fmt;

use crate::bank::{
    AllBank, AllIndex, HostVarBank, HostVarIndex, HostVarRevBank, HostVarRevIndex, SingleKeyBank,
    SingleKeyIndex, VarRevBank, VarRevIndex,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::ledger::QuotaLedger;
use crate::protocol::{
    AcceptancePacket, ClientId, DataPacket, NodeAddress, ProductionPacket, RequestPacket,
    ResponsePacket, Revision, Timestamp, VariableId, ANY_HOST, ANY_REVISION, ANY_VARIABLE,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Maps variable ids to dense ordinals backing the working set.
pub trait Schema {
    /// Dense ordinal of a variable, or `None` for ids outside the schema.
    fn ordinal(&self, variable_id: VariableId) -> Option<usize>;

    /// Total number of variables in the schema.
    fn variable_count(&self) -> usize;
}

/// Assigns revisions to newly produced values.
pub trait RevisionSet {
    /// Returns the next revision for `variable_id` and records it as taken.
    fn advance(&mut self, variable_id: VariableId) -> Revision;
}

/// Sink for outbound traffic: packet delivery to local clients and request
/// forwarding to peer nodes.
pub trait Transport {
    fn deliver(&mut self, client_id: ClientId, packet: &DataPacket);

    fn forward_request(&mut self, node_address: NodeAddress, request: &RequestPacket);
}

/// Configuration for a server node.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerConfig {
    /// Address of this node on the bus.
    /// Default: 1
    pub my_node_address: NodeAddress,

    /// Per-client cap on outstanding locally-satisfiable subscriptions.
    /// Default: 128
    pub max_local_requests: u32,

    /// Per-client cap on outstanding remote subscriptions.
    /// Default: 64
    pub max_remote_requests: u32,

    /// Number of client slots; client ids must stay below this.
    /// Default: 64
    pub max_clients: u16,

    /// Bucket hint for the by-host bank.
    /// Default: 64
    pub bank_size_host: u32,

    /// Bucket hint for the by-variable bank.
    /// Default: 1024
    pub bank_size_var: u32,

    /// Bucket hint for the host+variable bank.
    /// Default: 1024
    pub bank_size_host_var: u32,

    /// Bucket hint for the variable+revision bank.
    /// Default: 1024
    pub bank_size_var_rev: u32,

    /// Bucket hint for the remote host+variable+revision bank.
    /// Default: 256
    pub bank_size_host_var_rev: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            my_node_address: 1,
            max_local_requests: 128,
            max_remote_requests: 64,
            max_clients: 64,
            bank_size_host: 64,
            bank_size_var: 1024,
            bank_size_host_var: 1024,
            bank_size_var_rev: 1024,
            bank_size_host_var_rev: 256,
        }
    }
}

/// Which bank a request pattern lands in, derived from its wildcard fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    All,
    Host(NodeAddress),
    Var(VariableId),
    HostVar(NodeAddress, VariableId),
    VarRev(VariableId, Revision),
    HostVarRev(NodeAddress, VariableId, Revision),
}

/// The request bank and dispatch engine of one server node.
pub struct Server<C: Clock = SystemClock> {
    config: ServerConfig,
    schema: Box<dyn Schema>,
    revisions: Box<dyn RevisionSet>,
    transport: Box<dyn Transport>,
    clock: C,
    ledger: QuotaLedger,
    working_set: Vec<Option<DataPacket>>,
    bank_all: AllBank,
    bank_host: SingleKeyBank,
    bank_var: SingleKeyBank,
    bank_host_var: HostVarBank,
    bank_var_rev: VarRevBank,
    bank_host_var_rev: HostVarRevBank,
}

impl Server<SystemClock> {
    /// Builds a server on the wall clock.
    pub fn new(
        config: ServerConfig,
        schema: Box<dyn Schema>,
        revisions: Box<dyn RevisionSet>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self::with_clock(config, schema, revisions, transport, SystemClock)
    }
}

impl<C: Clock> Server<C> {
    /// Builds a server on a caller-supplied time source.
    pub fn with_clock(
        config: ServerConfig,
        schema: Box<dyn Schema>,
        revisions: Box<dyn RevisionSet>,
        transport: Box<dyn Transport>,
        clock: C,
    ) -> Self {
        let ledger = QuotaLedger::new(
            config.max_clients,
            config.max_local_requests,
            config.max_remote_requests,
        );
        let working_set = vec![None; schema.variable_count()];
        Self {
            bank_all: AllBank::new(AllIndex::new()),
            bank_host: SingleKeyBank::new(SingleKeyIndex::with_capacity(config.bank_size_host)),
            bank_var: SingleKeyBank::new(SingleKeyIndex::with_capacity(config.bank_size_var)),
            bank_host_var: HostVarBank::new(HostVarIndex::with_capacity(config.bank_size_host_var)),
            bank_var_rev: VarRevBank::new(VarRevIndex::with_capacity(config.bank_size_var_rev)),
            bank_host_var_rev: HostVarRevBank::new(HostVarRevIndex::with_capacity(
                config.bank_size_host_var_rev,
            )),
            config,
            schema,
            revisions,
            transport,
            clock,
            ledger,
            working_set,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts a request packet and answers with the quota picture either
    /// way. Rejections (invalid pattern, quota, unknown client) are carried
    /// in the response, never as errors.
    pub fn process_request(
        &mut self,
        requestor_id: ClientId,
        request: &RequestPacket,
    ) -> ResponsePacket {
        if !self.ledger.in_range(requestor_id) {
            log::warn!("request from out-of-range client {requestor_id}");
            return ResponsePacket {
                accepted: false,
                requests_remaining_local: 0,
                requests_remaining_remote: 0,
            };
        }
        if Self::is_rejectable_request(request) {
            log::warn!(
                "rejectable request from client {requestor_id}: \
                 node {} var {} rev {} qty {}",
                request.node_address,
                request.variable_id,
                request.revision,
                request.quantity
            );
            return self.response(false, requestor_id);
        }

        let accepted = if request.quantity > 0 {
            self.subscribe(requestor_id, request)
        } else {
            self.unsubscribe(requestor_id, request)
        };
        self.response(accepted, requestor_id)
    }

    /// Accepts a data packet: computes the fan-out across the pattern
    /// banks, delivers once per client in ascending id order, retires the
    /// satisfied one-shots, and refreshes the working set. Returns the
    /// number of clients delivered to.
    pub fn process_data(&mut self, provider_id: ClientId, packet: &DataPacket) -> Result<usize> {
        let ordinal = self
            .schema
            .ordinal(packet.variable_id)
            .ok_or(Error::UnknownVariable(packet.variable_id))?;

        let host = packet.node_address;
        let var = packet.variable_id;

        let mut recipients: BTreeSet<ClientId> = BTreeSet::new();
        recipients.extend(self.bank_all.subscribers(()));
        recipients.extend(self.bank_host.subscribers(host));
        recipients.extend(self.bank_var.subscribers(var));
        recipients.extend(self.bank_host_var.subscribers((host, var)));
        recipients.extend(self.enforce_fulfillment(packet));

        for &client_id in &recipients {
            self.transport.deliver(client_id, packet);
        }
        self.working_set[ordinal] = Some(packet.clone());

        log::debug!(
            "data ({host},{var},{}) from provider {provider_id}: {} recipients",
            packet.revision,
            recipients.len()
        );
        Ok(recipients.len())
    }

    /// Accepts a production packet: assigns the next revision, synthesises
    /// the data packet under this node's address, and dispatches it.
    pub fn process_production(
        &mut self,
        provider_id: ClientId,
        production: &ProductionPacket,
    ) -> Result<AcceptancePacket> {
        if self.schema.ordinal(production.variable_id).is_none() {
            return Err(Error::UnknownVariable(production.variable_id));
        }
        let revision = self.revisions.advance(production.variable_id);
        let packet = DataPacket {
            node_address: self.config.my_node_address,
            variable_id: production.variable_id,
            revision,
            payload: production.payload.clone(),
        };
        self.process_data(provider_id, &packet)?;
        Ok(AcceptancePacket {
            response_id: production.response_id,
            revision,
        })
    }

    /// Drains every subscription whose deadline has passed. Expiration is
    /// silent: clients are not notified. Returns the number dropped.
    pub fn enforce_timeouts(&mut self) -> usize {
        let now = self.clock.now();
        let mut dropped = 0;
        dropped += self.bank_all.pop_expired(now, &mut self.ledger).len();
        dropped += self.bank_host.pop_expired(now, &mut self.ledger).len();
        dropped += self.bank_var.pop_expired(now, &mut self.ledger).len();
        dropped += self.bank_host_var.pop_expired(now, &mut self.ledger).len();
        dropped += self.bank_var_rev.pop_expired(now, &mut self.ledger).len();
        dropped += self
            .bank_host_var_rev
            .pop_expired(now, &mut self.ledger)
            .len();
        if dropped > 0 {
            log::debug!("timeout sweep at {now}: dropped {dropped} subscriptions");
        }
        dropped
    }

    /// Retires the one-shot subscriptions satisfied by `delivered`,
    /// returning the affected clients in ascending id order. Pattern
    /// subscriptions are untouched.
    pub fn enforce_fulfillment(&mut self, delivered: &DataPacket) -> Vec<ClientId> {
        let host = delivered.node_address;
        let var = delivered.variable_id;
        let rev = delivered.revision;

        let mut clients = self.bank_var_rev.remove_by_key((var, rev), &mut self.ledger);
        if !self.is_my_address(host) {
            clients.extend(
                self.bank_host_var_rev
                    .remove_by_key((host, var, rev), &mut self.ledger),
            );
            clients.sort_unstable();
            clients.dedup();
        }
        clients
    }

    /// Local request slots still open for a client.
    pub fn client_free_requests_local(&self, client_id: ClientId) -> u32 {
        self.ledger.free_local(client_id)
    }

    /// Remote request slots still open for a client.
    pub fn client_free_requests_remote(&self, client_id: ClientId) -> u32 {
        self.ledger.free_remote(client_id)
    }

    /// Outstanding (local, remote) subscription counts for a client.
    pub fn outstanding(&self, client_id: ClientId) -> (u32, u32) {
        self.ledger.outstanding(client_id)
    }

    /// Live subscriptions across every bank.
    pub fn request_count(&self) -> usize {
        self.bank_all.len()
            + self.bank_host.len()
            + self.bank_var.len()
            + self.bank_host_var.len()
            + self.bank_var_rev.len()
            + self.bank_host_var_rev.len()
    }

    /// Earliest deadline across every bank, if any subscription is live.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        [
            self.bank_all.minimum_deadline().ok(),
            self.bank_host.minimum_deadline().ok(),
            self.bank_var.minimum_deadline().ok(),
            self.bank_host_var.minimum_deadline().ok(),
            self.bank_var_rev.minimum_deadline().ok(),
            self.bank_host_var_rev.minimum_deadline().ok(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Last packet accepted for a variable, if one has been published.
    pub fn working_variable(&self, variable_id: VariableId) -> Option<&DataPacket> {
        let ordinal = self.schema.ordinal(variable_id)?;
        self.working_set[ordinal].as_ref()
    }

    /// Whether a variable has delivered its first value.
    pub fn is_in_working_set(&self, variable_id: VariableId) -> bool {
        self.working_variable(variable_id).is_some()
    }

    pub fn summary(&self) -> String {
        self.to_string()
    }

    fn response(&self, accepted: bool, client_id: ClientId) -> ResponsePacket {
        ResponsePacket {
            accepted,
            requests_remaining_local: self.ledger.free_local(client_id),
            requests_remaining_remote: self.ledger.free_remote(client_id),
        }
    }

    /// Whether an address is equivalent to localhost.
    fn is_my_address(&self, address: NodeAddress) -> bool {
        address == ANY_HOST || address == self.config.my_node_address
    }

    /// Field combinations that no bank can represent.
    fn is_rejectable_request(request: &RequestPacket) -> bool {
        // A revision without a variable is meaningless, whatever the host.
        request.quantity == 0
            || (request.revision != ANY_REVISION && request.variable_id == ANY_VARIABLE)
    }

    fn classify(&self, request: &RequestPacket) -> Pattern {
        let node = request.node_address;
        let var = request.variable_id;
        let rev = request.revision;
        if var == ANY_VARIABLE {
            if node == ANY_HOST {
                Pattern::All
            } else {
                Pattern::Host(node)
            }
        } else if rev == ANY_REVISION {
            if node == ANY_HOST {
                Pattern::Var(var)
            } else {
                Pattern::HostVar(node, var)
            }
        } else if self.is_my_address(node) {
            // The host qualifier collapses for local specifics.
            Pattern::VarRev(var, rev)
        } else {
            Pattern::HostVarRev(node, var, rev)
        }
    }

    fn subscribe(&mut self, client_id: ClientId, request: &RequestPacket) -> bool {
        let deadline = request.deadline;
        let pattern = self.classify(request);
        // Only peer-satisfied requests charge the remote bucket.
        let remote = matches!(pattern, Pattern::HostVarRev(..));
        let result = match pattern {
            Pattern::All => self
                .bank_all
                .add((), client_id, deadline, remote, &mut self.ledger),
            Pattern::Host(host) => {
                self.bank_host
                    .add(host, client_id, deadline, remote, &mut self.ledger)
            }
            Pattern::Var(var) => {
                self.bank_var
                    .add(var, client_id, deadline, remote, &mut self.ledger)
            }
            Pattern::HostVar(host, var) => {
                self.bank_host_var
                    .add((host, var), client_id, deadline, remote, &mut self.ledger)
            }
            Pattern::VarRev(var, rev) => {
                self.bank_var_rev
                    .add((var, rev), client_id, deadline, remote, &mut self.ledger)
            }
            Pattern::HostVarRev(host, var, rev) => self.bank_host_var_rev.add(
                (host, var, rev),
                client_id,
                deadline,
                remote,
                &mut self.ledger,
            ),
        };

        match result {
            Ok(outcome) => {
                if let Pattern::HostVarRev(host, _, _) = pattern {
                    // Specific remote data is answered by the owning peer.
                    self.transport.forward_request(host, request);
                }
                log::trace!("client {client_id} {outcome:?} {pattern:?} until {deadline}");
                true
            }
            Err(err) => {
                log::warn!("refused subscription for client {client_id}: {err}");
                false
            }
        }
    }

    fn unsubscribe(&mut self, client_id: ClientId, request: &RequestPacket) -> bool {
        let pattern = self.classify(request);
        let removed = match pattern {
            Pattern::All => self.bank_all.remove((), client_id, &mut self.ledger),
            Pattern::Host(host) => self.bank_host.remove(host, client_id, &mut self.ledger),
            Pattern::Var(var) => self.bank_var.remove(var, client_id, &mut self.ledger),
            Pattern::HostVar(host, var) => {
                self.bank_host_var
                    .remove((host, var), client_id, &mut self.ledger)
            }
            Pattern::VarRev(var, rev) => {
                self.bank_var_rev
                    .remove((var, rev), client_id, &mut self.ledger)
            }
            Pattern::HostVarRev(host, var, rev) => {
                self.bank_host_var_rev
                    .remove((host, var, rev), client_id, &mut self.ledger)
            }
        };
        if let Pattern::HostVarRev(host, _, _) = pattern {
            self.transport.forward_request(host, request);
        }
        log::trace!("client {client_id} unsubscribed {pattern:?} (removed: {removed})");
        // Cancelling something already gone is still a success.
        true
    }
}

impl<C: Clock> fmt::Display for Server<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = self.working_set.iter().filter(|v| v.is_some()).count();
        write!(
            f,
            "node {}: {} subscriptions \
             (all {}, host {}, var {}, host/var {}, var/rev {}, host/var/rev {}), \
             working set {known}/{}",
            self.config.my_node_address,
            self.request_count(),
            self.bank_all.len(),
            self.bank_host.len(),
            self.bank_var.len(),
            self.bank_host_var.len(),
            self.bank_var_rev.len(),
            self.bank_host_var_rev.len(),
            self.working_set.len(),
        )
    }
}
