//! In-memory world/entity store: the collaborator boundary for everything
//! the reservation layer does to a live entity.
//!
//! The store is deliberately thin: worlds with a few queryable properties,
//! entities with positions and transferable state, and a per-player message
//! inbox standing in for chat delivery. All of the interesting behavior is
//! the snapshot contract: capture is total, apply is full-replacement for
//! inventory/armor/effects and idempotent.

use gatemesh_core::{Document, MeshError, MeshResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A point in some world.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// What kind of thing is traveling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Player,
    Minecart,
    Boat,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Minecart => "minecart",
            EntityKind::Boat => "boat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "player" => Some(EntityKind::Player),
            "minecart" => Some(EntityKind::Minecart),
            "boat" => Some(EntityKind::Boat),
            _ => None,
        }
    }
}

/// One stack of items in an inventory slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemStack {
    pub item: String,
    pub count: i32,
}

/// A timed potion-like effect.
#[derive(Debug, Clone, PartialEq)]
pub struct PotionEffect {
    pub effect: String,
    pub duration: i32,
    pub amplifier: i32,
}

/// Everything that travels with an entity through a gate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntitySnapshot {
    pub health: i32,
    pub remaining_air: i32,
    pub fire_ticks: i32,
    pub food_level: i32,
    pub exhaustion: f32,
    pub saturation: f32,
    pub level: i32,
    pub xp: f32,
    pub inventory: Vec<Option<ItemStack>>,
    pub armor: Vec<Option<ItemStack>>,
    pub effects: Vec<PotionEffect>,
}

fn encode_slots(slots: &[Option<ItemStack>]) -> Vec<Document> {
    slots
        .iter()
        .map(|slot| match slot {
            Some(stack) => Document::new()
                .with("item", stack.item.as_str())
                .with("count", stack.count),
            None => Document::new(),
        })
        .collect()
}

fn decode_slots(docs: &[Document]) -> Vec<Option<ItemStack>> {
    docs.iter()
        .map(|d| {
            d.get_str("item").map(|item| ItemStack {
                item: item.to_string(),
                count: d.get_int("count").unwrap_or(1),
            })
        })
        .collect()
}

impl EntitySnapshot {
    /// Encode for the wire. Empty slots become empty documents so slot
    /// ordering survives the trip.
    pub fn to_document(&self) -> Document {
        let effects: Vec<Document> = self
            .effects
            .iter()
            .map(|e| {
                Document::new()
                    .with("effect", e.effect.as_str())
                    .with("duration", e.duration)
                    .with("amplifier", e.amplifier)
            })
            .collect();
        Document::new()
            .with("health", self.health)
            .with("remainingAir", self.remaining_air)
            .with("fireTicks", self.fire_ticks)
            .with("foodLevel", self.food_level)
            .with("exhaustion", self.exhaustion)
            .with("saturation", self.saturation)
            .with("level", self.level)
            .with("xp", self.xp)
            .with("inventory", encode_slots(&self.inventory))
            .with("armor", encode_slots(&self.armor))
            .with("potionEffects", effects)
    }

    pub fn from_document(doc: &Document) -> MeshResult<Self> {
        let effects = doc
            .get_list("potionEffects")
            .unwrap_or(&[])
            .iter()
            .map(|d| {
                Ok(PotionEffect {
                    effect: d
                        .get_str("effect")
                        .ok_or_else(|| MeshError::Malformed("potion effect without name".into()))?
                        .to_string(),
                    duration: d.get_int("duration").unwrap_or(0),
                    amplifier: d.get_int("amplifier").unwrap_or(0),
                })
            })
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(Self {
            health: doc.get_int("health").unwrap_or(0),
            remaining_air: doc.get_int("remainingAir").unwrap_or(0),
            fire_ticks: doc.get_int("fireTicks").unwrap_or(0),
            food_level: doc.get_int("foodLevel").unwrap_or(0),
            exhaustion: doc.get_float("exhaustion").unwrap_or(0.0),
            saturation: doc.get_float("saturation").unwrap_or(0.0),
            level: doc.get_int("level").unwrap_or(0),
            xp: doc.get_float("xp").unwrap_or(0.0),
            inventory: decode_slots(doc.get_list("inventory").unwrap_or(&[])),
            armor: decode_slots(doc.get_list("armor").unwrap_or(&[])),
            effects,
        })
    }
}

/// A loaded world.
#[derive(Debug, Clone)]
pub struct World {
    pub name: String,
    pub seed: i64,
    pub time: i64,
    pub difficulty: String,
    pub spawn: Position,
}

#[derive(Debug, Clone)]
struct Entity {
    id: u64,
    kind: EntityKind,
    name: Option<String>,
    world: String,
    position: Position,
    snapshot: EntitySnapshot,
    inbox: Vec<String>,
}

/// Shared handle to every world and entity on this node.
///
/// Interior mutability keeps the store callable from the node loop and from
/// the API backend without threading `&mut` everywhere; each table is its
/// own lock.
#[derive(Default)]
pub struct WorldStore {
    worlds: Mutex<HashMap<String, World>>,
    entities: Mutex<HashMap<u64, Entity>>,
    next_entity_id: AtomicU64,
}

impl WorldStore {
    pub fn new() -> Self {
        Self {
            worlds: Mutex::new(HashMap::new()),
            entities: Mutex::new(HashMap::new()),
            next_entity_id: AtomicU64::new(1),
        }
    }

    pub fn add_world(&self, world: World) {
        self.worlds.lock().unwrap().insert(world.name.clone(), world);
    }

    pub fn remove_world(&self, name: &str) -> bool {
        self.worlds.lock().unwrap().remove(name).is_some()
    }

    pub fn has_world(&self, name: &str) -> bool {
        self.worlds.lock().unwrap().contains_key(name)
    }

    pub fn world(&self, name: &str) -> Option<World> {
        self.worlds.lock().unwrap().get(name).cloned()
    }

    pub fn world_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.worlds.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn a player with default transferable state.
    pub fn spawn_player(&self, name: &str, world: &str, position: Position) -> MeshResult<u64> {
        self.spawn(EntityKind::Player, Some(name.to_string()), world, position)
    }

    pub fn spawn_vehicle(&self, kind: EntityKind, world: &str, position: Position) -> MeshResult<u64> {
        self.spawn(kind, None, world, position)
    }

    fn spawn(
        &self,
        kind: EntityKind,
        name: Option<String>,
        world: &str,
        position: Position,
    ) -> MeshResult<u64> {
        if !self.has_world(world) {
            return Err(MeshError::Validation(format!("unknown world '{world}'")));
        }
        let id = self.next_entity_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = EntitySnapshot {
            health: 20,
            remaining_air: 300,
            food_level: 20,
            saturation: 5.0,
            ..Default::default()
        };
        self.entities.lock().unwrap().insert(
            id,
            Entity {
                id,
                kind,
                name,
                world: world.to_string(),
                position,
                snapshot,
                inbox: Vec::new(),
            },
        );
        Ok(id)
    }

    pub fn remove_entity(&self, id: u64) -> bool {
        self.entities.lock().unwrap().remove(&id).is_some()
    }

    pub fn entity_kind(&self, id: u64) -> Option<EntityKind> {
        self.entities.lock().unwrap().get(&id).map(|e| e.kind)
    }

    pub fn entity_name(&self, id: u64) -> Option<String> {
        self.entities.lock().unwrap().get(&id).and_then(|e| e.name.clone())
    }

    pub fn entity_by_name(&self, name: &str) -> Option<u64> {
        self.entities
            .lock()
            .unwrap()
            .values()
            .find(|e| e.name.as_deref() == Some(name))
            .map(|e| e.id)
    }

    pub fn entity_world(&self, id: u64) -> Option<String> {
        self.entities.lock().unwrap().get(&id).map(|e| e.world.clone())
    }

    pub fn entity_position(&self, id: u64) -> Option<Position> {
        self.entities.lock().unwrap().get(&id).map(|e| e.position)
    }

    pub fn players(&self) -> Vec<(u64, String, String)> {
        self.entities
            .lock()
            .unwrap()
            .values()
            .filter_map(|e| {
                e.name
                    .as_ref()
                    .map(|n| (e.id, n.clone(), e.world.clone()))
            })
            .collect()
    }

    /// Capture the transferable state of an entity.
    pub fn snapshot(&self, id: u64) -> MeshResult<EntitySnapshot> {
        self.entities
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.snapshot.clone())
            .ok_or_else(|| MeshError::Validation(format!("unknown entity {id}")))
    }

    /// Apply a snapshot: full replacement for inventory, armor, and effects.
    /// Applying the same snapshot twice leaves the entity unchanged.
    pub fn apply_snapshot(&self, id: u64, snapshot: &EntitySnapshot) -> MeshResult<()> {
        let mut entities = self.entities.lock().unwrap();
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| MeshError::Validation(format!("unknown entity {id}")))?;
        entity.snapshot = snapshot.clone();
        Ok(())
    }

    /// Directly mutate an entity's transferable state (for setup and tests).
    pub fn update_snapshot(
        &self,
        id: u64,
        update: impl FnOnce(&mut EntitySnapshot),
    ) -> MeshResult<()> {
        let mut entities = self.entities.lock().unwrap();
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| MeshError::Validation(format!("unknown entity {id}")))?;
        update(&mut entity.snapshot);
        Ok(())
    }

    /// Relocate an entity, possibly across worlds.
    pub fn teleport(&self, id: u64, world: &str, position: Position) -> MeshResult<()> {
        if !self.has_world(world) {
            return Err(MeshError::Validation(format!("unknown world '{world}'")));
        }
        let mut entities = self.entities.lock().unwrap();
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| MeshError::Validation(format!("unknown entity {id}")))?;
        entity.world = world.to_string();
        entity.position = position;
        Ok(())
    }

    /// Deliver a message to a player's inbox. Non-players drop it.
    pub fn notify(&self, id: u64, message: impl Into<String>) {
        let mut entities = self.entities.lock().unwrap();
        if let Some(entity) = entities.get_mut(&id) {
            if entity.name.is_some() {
                entity.inbox.push(message.into());
            }
        }
    }

    pub fn notify_player(&self, name: &str, message: impl Into<String>) {
        if let Some(id) = self.entity_by_name(name) {
            self.notify(id, message);
        }
    }

    /// Take everything delivered to a player since the last drain.
    pub fn drain_messages(&self, id: u64) -> Vec<String> {
        let mut entities = self.entities.lock().unwrap();
        entities
            .get_mut(&id)
            .map(|e| std::mem::take(&mut e.inbox))
            .unwrap_or_default()
    }
}
