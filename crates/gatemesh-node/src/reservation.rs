//! The teleport reservation state machine.
//!
//! One reservation takes one entity from "stepped into a gate" through
//! validation, an optional cancellable countdown, cost deduction, and
//! relocation, possibly onto another node, with rollback of deducted
//! costs on any post-departure failure. Validation never touches entity,
//! economy, or world state; anything after departure that fails refunds
//! what was deducted and never reverses a completed physical move.
//!
//! Every failure path ends in exactly one message to the triggering actor
//! and clears the entity's gate-lock.

use crate::economy::Economy;
use crate::gate::Gate;
use crate::node::{Node, NodeEvent};
use crate::server::Server;
use crate::world::{EntityKind, EntitySnapshot};
use gatemesh_core::{Document, Message, MeshError, MeshResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of one teleport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Created,
    Validating,
    CountingDown,
    Departing,
    Arriving,
    Completed,
    Cancelled,
    Failed,
}

/// A sender-side reservation waiting on the destination node.
#[derive(Debug)]
pub struct Reservation {
    pub id: u64,
    pub entity: u64,
    pub player_name: Option<String>,
    pub origin: String,
    pub dest_server: String,
    pub dest_gate: String,
    /// Send-side cost already deducted; refunded on denial or timeout.
    pub deducted: f64,
    /// The destination validated us; the entity has been handed over.
    pub approved: bool,
    pub state: ReservationState,
}

/// A running countdown for one entity.
pub struct Countdown {
    pub gate: String,
    task: JoinHandle<()>,
}

/// Reservation bookkeeping: in-flight remote reservations, gate-locks, and
/// countdowns. Mutated only from the node loop.
#[derive(Default)]
pub struct Reservations {
    next_id: u64,
    active: HashMap<u64, Reservation>,
    gate_locks: HashMap<u64, Instant>,
    countdowns: HashMap<u64, Countdown>,
}

impl Reservations {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Suppress further reservations for this entity's current movement.
    pub fn add_gate_lock(&mut self, entity: u64, ttl: Duration) {
        self.gate_locks.insert(entity, Instant::now() + ttl);
    }

    /// Expired locks are purged as they are checked.
    pub fn is_gate_locked(&mut self, entity: u64) -> bool {
        match self.gate_locks.get(&entity) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                self.gate_locks.remove(&entity);
                false
            }
            None => false,
        }
    }

    pub fn release_gate_lock(&mut self, entity: u64) {
        self.gate_locks.remove(&entity);
    }

    pub fn lock_count(&self) -> usize {
        self.gate_locks.len()
    }

    pub fn has_countdown(&self, entity: u64) -> bool {
        self.countdowns.contains_key(&entity)
    }

    pub fn countdown_gate(&self, entity: u64) -> Option<String> {
        self.countdowns.get(&entity).map(|c| c.gate.clone())
    }

    fn insert_countdown(&mut self, entity: u64, gate: String, task: JoinHandle<()>) {
        self.countdowns.insert(entity, Countdown { gate, task });
    }

    /// Tear down a countdown. Cancellation is immediate: the timer task is
    /// aborted before this returns.
    pub fn remove_countdown(&mut self, entity: u64) -> Option<Countdown> {
        let countdown = self.countdowns.remove(&entity)?;
        countdown.task.abort();
        Some(countdown)
    }

    /// Abort every countdown attached to `gate`; returns the entities whose
    /// countdowns died.
    pub fn cancel_countdowns_for_gate(&mut self, gate: &str) -> Vec<u64> {
        let doomed: Vec<u64> = self
            .countdowns
            .iter()
            .filter(|(_, c)| c.gate == gate)
            .map(|(e, _)| *e)
            .collect();
        for entity in &doomed {
            self.remove_countdown(*entity);
        }
        doomed
    }

    fn insert(&mut self, reservation: Reservation) {
        self.active.insert(reservation.id, reservation);
    }

    fn remove(&mut self, id: u64) -> Option<Reservation> {
        self.active.remove(&id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut Reservation> {
        self.active.get_mut(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Output of a successful validation pass: everything departure needs,
/// gathered without having touched any state.
struct PreparedTeleport {
    entity: u64,
    entity_kind: EntityKind,
    player_name: Option<String>,
    origin: String,
    dest: Gate,
    send_cost: f64,
}

impl Node {
    /// Entry point: an entity crossed into a gate's portal region (or a
    /// countdown asked for departure). Duplicate triggers for the same
    /// movement are suppressed by the gate-lock.
    pub fn trigger_entry(&mut self, entity: u64, gate_full: &str) {
        if self.reservations.is_gate_locked(entity) {
            debug!(entity, gate = %gate_full, "gate-locked, ignoring trigger");
            return;
        }
        if self.reservations.has_countdown(entity) {
            return;
        }
        let Some(gate) = self.gates.local(gate_full) else {
            warn!(gate = %gate_full, "trigger for unknown gate");
            return;
        };
        let Some(kind) = self.worlds.entity_kind(entity) else {
            return;
        };
        let is_player = kind == EntityKind::Player;
        if is_player && !gate.policy.trigger_players {
            return;
        }
        if !is_player && !gate.policy.trigger_vehicles {
            return;
        }

        let lock_ttl = self.settings.gate_lock_expiration;
        if !gate.is_open() {
            self.reservations.add_gate_lock(entity, lock_ttl);
            self.notify_actor(entity, "this gate is closed");
            return;
        }

        self.reservations.add_gate_lock(entity, lock_ttl);
        debug!(entity, gate = %gate_full, state = ?ReservationState::Created, "reservation");

        // Countdown only applies to player-triggered entry.
        if is_player && gate.countdown_ms > 0 {
            let duration = gate.countdown_ms;
            let interval = gate.countdown_interval_ms;
            self.start_countdown(entity, gate_full.to_string(), duration, interval);
            debug!(entity, state = ?ReservationState::CountingDown, "reservation");
            self.notify_actor(
                entity,
                format!("teleporting in {:.1}s", duration as f64 / 1000.0),
            );
            return;
        }

        self.depart(entity, gate_full);
    }

    fn start_countdown(&mut self, entity: u64, gate: String, duration_ms: u64, interval_ms: u64) {
        let events = self.events();
        let interval = interval_ms.clamp(1, duration_ms.max(1));
        let task = tokio::spawn(async move {
            let mut remaining = duration_ms;
            loop {
                tokio::time::sleep(Duration::from_millis(interval)).await;
                remaining = remaining.saturating_sub(interval);
                if remaining == 0 {
                    let _ = events.send(NodeEvent::CountdownExpired { entity }).await;
                    break;
                }
                if events
                    .send(NodeEvent::CountdownTick {
                        entity,
                        remaining_ms: remaining,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        self.reservations.insert_countdown(entity, gate, task);
    }

    /// A countdown timer ticked: update the player, or cancel if they
    /// wandered out of range.
    pub(crate) fn countdown_tick(&mut self, entity: u64, remaining_ms: u64) {
        let Some(gate_name) = self.reservations.countdown_gate(entity) else {
            return;
        };
        let Some(gate) = self.gates.local(&gate_name) else {
            self.cancel_countdown(entity);
            return;
        };
        let in_range = match (
            self.worlds.entity_world(entity),
            self.worlds.entity_position(entity),
        ) {
            (Some(world), Some(pos)) => {
                world == gate.world() && gate.spawn.distance(&pos) <= gate.countdown_radius
            }
            _ => false,
        };
        if !in_range {
            self.cancel_countdown(entity);
            return;
        }
        self.notify_actor(
            entity,
            format!("teleporting in {:.1}s", remaining_ms as f64 / 1000.0),
        );
    }

    /// Cancel a running countdown: timer torn down, gate-lock released, no
    /// other state touched.
    pub fn cancel_countdown(&mut self, entity: u64) {
        if self.reservations.remove_countdown(entity).is_some() {
            self.reservations.release_gate_lock(entity);
            self.notify_actor(entity, "teleport cancelled");
        }
    }

    pub(crate) fn countdown_expired(&mut self, entity: u64) {
        if let Some(countdown) = self.reservations.remove_countdown(entity) {
            self.depart(entity, &countdown.gate);
        }
    }

    /// Validate and execute a departure through `origin_full`.
    pub fn depart(&mut self, entity: u64, origin_full: &str) {
        debug!(entity, gate = %origin_full, state = ?ReservationState::Validating, "reservation");
        match self.validate_departure(entity, origin_full) {
            Ok(prepared) => self.execute_departure(prepared),
            Err(e) => self.cancel_reservation(entity, e),
        }
    }

    /// `Validating`: resolve the destination (advancing the shared link
    /// cursor), then check permission and funds. No side effects beyond the
    /// cursor; a failure leaves entity, economy, and world untouched.
    fn validate_departure(&mut self, entity: u64, origin_full: &str) -> MeshResult<PreparedTeleport> {
        let entity_kind = self
            .worlds
            .entity_kind(entity)
            .ok_or_else(|| MeshError::Validation("unknown traveler".into()))?;
        let player_name = self.worlds.entity_name(entity);

        {
            let origin = self
                .gates
                .local_mut(origin_full)
                .ok_or_else(|| MeshError::Validation(format!("unknown gate '{origin_full}'")))?;
            if !origin.is_open() {
                return Err(MeshError::Validation("this gate is closed".into()));
            }
            if origin.send_next_link {
                origin.next_link()?;
            }
        }

        let origin = self.gates.local(origin_full).unwrap();
        let dest_name = origin.destination()?.to_string();
        let dest = self
            .gates
            .get(&dest_name)
            .cloned()
            .ok_or_else(|| {
                MeshError::Validation(format!("unknown or offline gate '{dest_name}'"))
            })?;

        if let Some(name) = &player_name {
            self.permissions
                .require(name, &format!("gate.use.{origin_full}"))?;
        }

        // Verify funds without deducting anything yet.
        let send_cost = if player_name.is_some() {
            origin.send_cost(&dest)
        } else {
            0.0
        };
        if let Some(name) = &player_name {
            if send_cost > 0.0 {
                self.economy.require_funds(name, send_cost).map_err(|_| {
                    MeshError::Validation(format!(
                        "this gate requires {}",
                        Economy::format(send_cost)
                    ))
                })?;
            }
            if let Gate::Local(dest_gate) = &dest {
                let total = send_cost + dest_gate.receive_cost(&Gate::Local(origin.clone()));
                if total > 0.0 {
                    self.economy.require_funds(name, total).map_err(|_| {
                        MeshError::Validation(format!(
                            "total travel cost requires {}",
                            Economy::format(total)
                        ))
                    })?;
                }
            }
        }

        Ok(PreparedTeleport {
            entity,
            entity_kind,
            player_name,
            origin: origin_full.to_string(),
            dest,
            send_cost,
        })
    }

    /// `Departing` onward: snapshot, deduct, relocate. Failure past the
    /// deduction refunds it before surfacing the error.
    fn execute_departure(&mut self, t: PreparedTeleport) {
        debug!(entity = t.entity, state = ?ReservationState::Departing, "reservation");
        let snapshot = match self.worlds.snapshot(t.entity) {
            Ok(s) => s,
            Err(e) => return self.cancel_reservation(t.entity, e),
        };

        if t.send_cost > 0.0 {
            let payer = t.player_name.as_deref().unwrap_or_default();
            if let Err(e) = self.economy.deduct_funds(payer, t.send_cost) {
                return self.cancel_reservation(t.entity, e);
            }
        }

        match &t.dest {
            Gate::Local(dest) => {
                let dest_full = dest.full_name();
                self.arrive_local(&t, &dest_full, snapshot);
            }
            Gate::Remote(remote) => {
                let remote = remote.clone();
                self.depart_remote(&t, remote, snapshot);
            }
        }
    }

    /// Local arrival: relocate, reapply state, then collect the receive
    /// cost. A receive-cost failure degrades to a warning; the move has
    /// already happened and is never reversed.
    fn arrive_local(&mut self, t: &PreparedTeleport, dest_full: &str, snapshot: EntitySnapshot) {
        let Some(dest) = self.gates.local(dest_full) else {
            return self.fail_after_departure(
                t,
                MeshError::Validation(format!("unknown or offline gate '{dest_full}'")),
            );
        };
        let world = dest.world().to_string();
        let spawn = dest.spawn;
        let receive_cost = match t.player_name {
            Some(_) => {
                let origin = self.gates.local(&t.origin).cloned();
                match origin {
                    Some(o) => dest.receive_cost(&Gate::Local(o)),
                    None => 0.0,
                }
            }
            None => 0.0,
        };

        if let Err(e) = self.worlds.teleport(t.entity, &world, spawn) {
            return self.fail_after_departure(t, e);
        }
        if let Err(e) = self.worlds.apply_snapshot(t.entity, &snapshot) {
            // The move itself stands; state restore trouble is logged only.
            warn!(entity = t.entity, error = %e, "could not reapply entity state");
        }

        // Receive cost comes after the successful move, never before.
        if receive_cost > 0.0 {
            let payer = t.player_name.as_deref().unwrap_or_default();
            if self.economy.deduct_funds(payer, receive_cost).is_err() {
                warn!(
                    player = %payer,
                    cost = receive_cost,
                    "arrival cost not collected"
                );
            }
        }

        self.reservations.release_gate_lock(t.entity);
        // Hold a fresh lock so materializing inside the destination's
        // region doesn't immediately re-trigger it.
        self.reservations
            .add_gate_lock(t.entity, self.settings.gate_lock_expiration);
        self.notify_actor(t.entity, format!("arrived at '{dest_full}'"));
        info!(entity = t.entity, from = %t.origin, to = %dest_full, "teleport completed");
    }

    /// Remote departure: ship the snapshot to the destination node and wait
    /// for its verdict inside the arrival window.
    fn depart_remote(
        &mut self,
        t: &PreparedTeleport,
        remote: crate::gate::RemoteGate,
        snapshot: EntitySnapshot,
    ) {
        let Some(server) = self.servers.get(&remote.server) else {
            return self.fail_after_departure(t, MeshError::NotConnected);
        };

        let id = self.reservations.alloc_id();
        let reservation_doc = Document::new()
            .with("id", id as i64)
            .with("entityType", t.entity_kind.as_str())
            .with("fromGate", t.origin.as_str())
            .with("toGate", remote.local_name())
            .with("state", snapshot.to_document());
        let reservation_doc = match &t.player_name {
            Some(name) => reservation_doc.with("playerName", name.as_str()),
            None => reservation_doc,
        };

        if let Err(e) = server.send(Message::Reservation {
            reservation: reservation_doc,
        }) {
            return self.fail_after_departure(t, e);
        }

        debug!(id, entity = t.entity, server = %remote.server, "reservation sent");
        self.reservations.insert(Reservation {
            id,
            entity: t.entity,
            player_name: t.player_name.clone(),
            origin: t.origin.clone(),
            dest_server: remote.server.clone(),
            dest_gate: remote.full_name(),
            deducted: t.send_cost,
            approved: false,
            state: ReservationState::Arriving,
        });

        let events = self.events();
        let window = self.settings.arrival_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = events
                .send(NodeEvent::ArrivalWindowExpired { reservation: id })
                .await;
        });
    }

    /// A pre-side-effect failure: release the lock and tell the actor why,
    /// once.
    fn cancel_reservation(&mut self, entity: u64, error: MeshError) {
        self.reservations.release_gate_lock(entity);
        let message = match &error {
            MeshError::Validation(m) => m.clone(),
            other => format!("teleport failed: {other}"),
        };
        debug!(entity, %error, state = ?ReservationState::Cancelled, "reservation");
        self.notify_actor(entity, message);
    }

    /// A post-departure failure: refund what was deducted, then report.
    fn fail_after_departure(&mut self, t: &PreparedTeleport, error: MeshError) {
        if t.send_cost > 0.0 {
            if let Some(name) = &t.player_name {
                self.economy.credit(name, t.send_cost);
            }
        }
        self.reservations.release_gate_lock(t.entity);
        let message = match &error {
            MeshError::Validation(m) => m.clone(),
            other => format!("teleport failed: {other}"),
        };
        warn!(entity = t.entity, %error, "teleport failed after departure");
        self.notify_actor(t.entity, message);
    }

    /// Receiving side: a peer shipped us a reservation. Validate the
    /// arrival gate and answer approved or denied; an approved entity
    /// arrives immediately.
    pub(crate) fn receive_reservation(&mut self, server: &Arc<Server>, doc: &Document) {
        let Some(id) = doc.get_long("id").map(|v| v as u64) else {
            warn!(server = %server.name(), "reservation without id");
            return;
        };
        match self.validate_arrival(server, doc) {
            Ok(plan) => {
                server.send_if_connected(Message::ReservationApproved { id });
                self.complete_arrival(server, plan);
            }
            Err(e) => {
                debug!(server = %server.name(), id, reason = %e, "reservation denied");
                server.send_if_connected(Message::ReservationDenied {
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn validate_arrival(&self, server: &Arc<Server>, doc: &Document) -> MeshResult<ArrivalPlan> {
        let id = doc
            .get_long("id")
            .ok_or_else(|| MeshError::Protocol("reservation without id".into()))?
            as u64;
        let to_gate = doc
            .get_str("toGate")
            .ok_or_else(|| MeshError::Protocol("reservation without toGate".into()))?
            .to_string();
        let entity_kind = doc
            .get_str("entityType")
            .and_then(EntityKind::parse)
            .ok_or_else(|| MeshError::Protocol("unknown entity type".into()))?;
        let player_name = doc.get_str("playerName").map(str::to_string);
        let snapshot = doc
            .get_doc("state")
            .ok_or_else(|| MeshError::Protocol("reservation without state".into()))
            .and_then(EntitySnapshot::from_document)?;

        let gate = self
            .gates
            .local(&to_gate)
            .ok_or_else(|| MeshError::Validation(format!("unknown gate '{to_gate}'")))?;

        if let Some(name) = &player_name {
            self.permissions
                .require(name, &format!("gate.use.{}", gate.full_name()))?;
            let cost = gate.receive_cost_remote();
            if cost > 0.0 {
                self.economy.require_funds(name, cost).map_err(|_| {
                    MeshError::Validation(format!(
                        "remote gate requires {}",
                        Economy::format(cost)
                    ))
                })?;
            }
        }

        let from_gate = doc
            .get_str("fromGate")
            .map(|from| format!("{}.{from}", server.name()));

        Ok(ArrivalPlan {
            id,
            entity_kind,
            player_name,
            to_gate,
            from_gate,
            snapshot,
        })
    }

    fn complete_arrival(&mut self, server: &Arc<Server>, plan: ArrivalPlan) {
        let Some(gate) = self.gates.local(&plan.to_gate) else {
            return;
        };
        let world = gate.world().to_string();
        let spawn = gate.spawn;
        let receive_cost = match plan.player_name {
            Some(_) => gate.receive_cost_remote(),
            None => 0.0,
        };

        let spawned = match (&plan.entity_kind, &plan.player_name) {
            (EntityKind::Player, Some(name)) => self.worlds.spawn_player(name, &world, spawn),
            (kind, _) => self.worlds.spawn_vehicle(*kind, &world, spawn),
        };
        let entity = match spawned {
            Ok(e) => e,
            Err(e) => {
                warn!(gate = %plan.to_gate, error = %e, "could not materialize arrival");
                return;
            }
        };
        if let Err(e) = self.worlds.apply_snapshot(entity, &plan.snapshot) {
            warn!(entity, error = %e, "could not apply arrival state");
        }

        if let Some(from) = &plan.from_gate {
            if let Some(gate) = self.gates.local_mut(&plan.to_gate) {
                gate.attach(from);
            }
        }

        if receive_cost > 0.0 {
            let payer = plan.player_name.as_deref().unwrap_or_default();
            if self.economy.deduct_funds(payer, receive_cost).is_err() {
                warn!(player = %payer, cost = receive_cost, "arrival cost not collected");
            }
        }

        // Materializing inside the arrival gate must not bounce them back.
        self.reservations
            .add_gate_lock(entity, self.settings.gate_lock_expiration);
        self.notify_actor(entity, format!("arrived at '{}'", plan.to_gate));
        info!(entity, gate = %plan.to_gate, from_server = %server.name(), "arrival completed");
        server.send_if_connected(Message::ReservationArrived { id: plan.id });
    }

    /// Sender side: destination validated the reservation. Hand the entity
    /// over; the reservation stays open until `reservationArrived`.
    pub(crate) fn reservation_approved(&mut self, id: u64) {
        if let Some(res) = self.reservations.get_mut(id) {
            res.approved = true;
            let entity = res.entity;
            debug!(id, entity, "reservation approved, handing entity over");
            self.worlds.remove_entity(entity);
            self.reservations.release_gate_lock(entity);
        }
    }

    /// Sender side: destination refused. Refund the send cost and surface
    /// the remote reason to the actor.
    pub(crate) fn reservation_denied(&mut self, id: u64, reason: &str) {
        let Some(mut res) = self.reservations.remove(id) else {
            return;
        };
        res.state = ReservationState::Failed;
        if res.deducted > 0.0 {
            if let Some(name) = &res.player_name {
                self.economy.credit(name, res.deducted);
            }
        }
        self.reservations.release_gate_lock(res.entity);
        warn!(id, entity = res.entity, reason, "reservation denied by destination");
        self.notify_actor(res.entity, reason.to_string());
    }

    /// Sender side: final confirmation from the destination.
    pub(crate) fn reservation_arrived(&mut self, id: u64) {
        if let Some(mut res) = self.reservations.remove(id) {
            res.state = ReservationState::Completed;
            debug!(id, entity = res.entity, to = %res.dest_gate, "reservation completed");
        }
    }

    /// Sender side: the arrival window closed without a verdict.
    pub(crate) fn arrival_window_expired(&mut self, id: u64) {
        let Some(mut res) = self.reservations.remove(id) else {
            return;
        };
        if res.approved {
            // Entity already handed over; nothing left to roll back.
            warn!(id, to = %res.dest_gate, "no arrival confirmation received");
            return;
        }
        res.state = ReservationState::Failed;
        if res.deducted > 0.0 {
            if let Some(name) = &res.player_name {
                self.economy.credit(name, res.deducted);
            }
        }
        self.reservations.release_gate_lock(res.entity);
        warn!(id, entity = res.entity, to = %res.dest_gate, "reservation timed out");
        self.notify_actor(res.entity, format!("teleport to '{}' timed out", res.dest_gate));
    }
}

#[derive(Debug)]
struct ArrivalPlan {
    id: u64,
    entity_kind: EntityKind,
    player_name: Option<String>,
    to_gate: String,
    from_gate: Option<String>,
    snapshot: EntitySnapshot,
}
