//! Last-known state of the matrix
//!
//! The cache is the only place input and output records are mutated. Device
//! traffic reaches it from the link's reader task; readers get clones.

use crate::error::{MatrixError, Result};
use crate::subscription::{ChangeBus, ChangeEvent};
use crate::types::{GroupState, InputIndex, OutputIndex, Source, Zone, ZoneValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

#[derive(Default)]
struct MatrixState {
    sources: BTreeMap<InputIndex, Source>,
    zones: BTreeMap<OutputIndex, Zone>,
    directory: SourceDirectory,
}

/// Bidirectional label/index lookup for inputs
#[derive(Debug, Clone, Default)]
pub struct SourceDirectory {
    by_index: BTreeMap<InputIndex, String>,
    by_label: BTreeMap<String, InputIndex>,
}

impl SourceDirectory {
    fn build<'a>(sources: impl Iterator<Item = &'a Source>) -> Self {
        let mut directory = Self::default();
        for source in sources.filter(|s| s.enabled) {
            if let Some(existing) = directory.by_label.get(&source.label) {
                tracing::warn!(
                    "Inputs {} and {} share the label '{}'; selecting by label picks {}",
                    existing,
                    source.index,
                    source.label,
                    existing
                );
            } else {
                directory.by_label.insert(source.label.clone(), source.index);
            }
            directory.by_index.insert(source.index, source.label.clone());
        }
        directory
    }

    pub fn index_of(&self, label: &str) -> Option<InputIndex> {
        self.by_label.get(label).copied()
    }

    pub fn label_of(&self, index: InputIndex) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    /// Enabled input labels ordered by input index
    pub fn labels(&self) -> Vec<String> {
        self.by_index.values().cloned().collect()
    }
}

/// Shared handle to the cached matrix state
#[derive(Clone)]
pub struct StateCache {
    state: Arc<RwLock<MatrixState>>,
    ready: Arc<watch::Sender<bool>>,
    bus: ChangeBus,
}

impl StateCache {
    pub fn new(bus: ChangeBus) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(MatrixState::default())),
            ready: Arc::new(ready),
            bus,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MatrixState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MatrixState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Whether a full snapshot has been applied
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub(crate) fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Replace all inputs and outputs and mark the cache ready
    ///
    /// Grouping survives for outputs that are still present.
    pub fn apply_snapshot(&self, sources: Vec<Source>, zones: Vec<Zone>) {
        let regrouped = {
            let mut state = self.write();
            let sources: BTreeMap<_, _> = sources.into_iter().map(|s| (s.index, s)).collect();

            let mut new_zones = BTreeMap::new();
            for mut zone in zones {
                zone.input_channel = checked_input(&sources, zone.index, zone.input_channel);
                if let Some(previous) = state.zones.get(&zone.index) {
                    zone.group = previous.group.clone();
                }
                new_zones.insert(zone.index, zone);
            }
            let regrouped = prune_groups(&mut new_zones);

            state.directory = SourceDirectory::build(sources.values());
            state.sources = sources;
            state.zones = new_zones;

            tracing::info!(
                "Applied snapshot: {} inputs, {} outputs",
                state.sources.len(),
                state.zones.len()
            );
            regrouped
        };

        self.ready.send_replace(true);
        self.bus.publish(ChangeEvent::Snapshot);
        for event in regrouped {
            self.bus.publish(event);
        }
    }

    /// Update one attribute of one output
    ///
    /// Returns the emitted event, or `None` when the value was already current.
    pub fn apply_delta(&self, index: OutputIndex, value: ZoneValue) -> Result<Option<ChangeEvent>> {
        let event = {
            let mut state = self.write();
            let value = match value {
                ZoneValue::InputChannel(input) => {
                    ZoneValue::InputChannel(checked_input(&state.sources, index, input))
                }
                other => other,
            };
            let zone = state
                .zones
                .get_mut(&index)
                .ok_or_else(|| MatrixError::output_not_found(index))?;

            let field = value.field();
            zone.set(value.clone()).map(|old| ChangeEvent::Zone {
                index,
                field,
                old,
                new: value,
            })
        };

        if let Some(event) = &event {
            self.bus.publish(event.clone());
        }
        Ok(event)
    }

    /// Refresh an input's label
    pub fn apply_source_label(&self, index: InputIndex, label: String) -> Result<Option<ChangeEvent>> {
        let event = {
            let mut state = self.write();
            let source = state
                .sources
                .get_mut(&index)
                .ok_or_else(|| MatrixError::input_not_found(index))?;
            if source.label == label {
                None
            } else {
                let old = std::mem::replace(&mut source.label, label.clone());
                let directory = SourceDirectory::build(state.sources.values());
                state.directory = directory;
                Some(ChangeEvent::SourceLabel { index, old, new: label })
            }
        };

        if let Some(event) = &event {
            self.bus.publish(event.clone());
        }
        Ok(event)
    }

    /// Put `members` in a group led by `master`
    ///
    /// Members already in another group are moved; a member that was itself
    /// a master releases its old members.
    pub fn join(&self, master: OutputIndex, members: &[OutputIndex]) -> Result<()> {
        let events = {
            let mut state = self.write();
            if !state.zones.contains_key(&master) {
                return Err(MatrixError::output_not_found(master));
            }
            if let Some(missing) = members.iter().find(|m| !state.zones.contains_key(*m)) {
                return Err(MatrixError::output_not_found(*missing));
            }
            if members.contains(&master) {
                return Err(MatrixError::InvalidArgument(format!(
                    "output {} cannot join its own group",
                    master
                )));
            }

            let mut groups = current_groups(&state.zones);
            for set in groups.values_mut() {
                set.remove(&master);
            }
            for member in members {
                for set in groups.values_mut() {
                    set.remove(member);
                }
                if let Some(released) = groups.remove(member) {
                    tracing::info!("Output {} joined output {}, releasing {:?}", member, master, released);
                }
            }
            groups.entry(master).or_default().extend(members.iter().copied());
            apply_groups(&mut state.zones, &groups)
        };

        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Remove outputs from their groups; removing a master dissolves its group
    pub fn unjoin(&self, zones: &[OutputIndex]) -> Result<()> {
        let events = {
            let mut state = self.write();
            if let Some(missing) = zones.iter().find(|z| !state.zones.contains_key(*z)) {
                return Err(MatrixError::output_not_found(*missing));
            }
            let mut groups = current_groups(&state.zones);
            for zone in zones {
                groups.remove(zone);
                for set in groups.values_mut() {
                    set.remove(zone);
                }
            }
            apply_groups(&mut state.zones, &groups)
        };

        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    pub fn get_output(&self, index: OutputIndex) -> Result<Zone> {
        self.read()
            .zones
            .get(&index)
            .cloned()
            .ok_or_else(|| MatrixError::output_not_found(index))
    }

    pub fn get_input(&self, index: InputIndex) -> Result<Source> {
        self.read()
            .sources
            .get(&index)
            .cloned()
            .ok_or_else(|| MatrixError::input_not_found(index))
    }

    pub fn enabled_inputs(&self) -> Vec<Source> {
        self.read()
            .sources
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    pub fn enabled_outputs(&self) -> Vec<Zone> {
        self.read()
            .zones
            .values()
            .filter(|z| z.enabled)
            .cloned()
            .collect()
    }

    pub fn source_directory(&self) -> SourceDirectory {
        self.read().directory.clone()
    }
}

/// Drop references to inputs that do not exist
fn checked_input(
    sources: &BTreeMap<InputIndex, Source>,
    output: OutputIndex,
    input: Option<InputIndex>,
) -> Option<InputIndex> {
    match input {
        Some(index) if !sources.contains_key(&index) => {
            tracing::warn!(
                "Output {} references unknown input {}, treating as unassigned",
                output,
                index
            );
            None
        }
        other => other,
    }
}

fn current_groups(zones: &BTreeMap<OutputIndex, Zone>) -> BTreeMap<OutputIndex, BTreeSet<OutputIndex>> {
    zones
        .values()
        .filter_map(|z| match &z.group {
            GroupState::Master(members) => Some((z.index, members.clone())),
            _ => None,
        })
        .collect()
}

/// Rewrite every zone's group state from a master -> members map, returning
/// change events for the zones that moved
fn apply_groups(
    zones: &mut BTreeMap<OutputIndex, Zone>,
    groups: &BTreeMap<OutputIndex, BTreeSet<OutputIndex>>,
) -> Vec<ChangeEvent> {
    let mut desired: BTreeMap<OutputIndex, GroupState> = BTreeMap::new();
    for (master, members) in groups.iter().filter(|(_, m)| !m.is_empty()) {
        desired.insert(*master, GroupState::Master(members.clone()));
        for member in members {
            desired.insert(*member, GroupState::Member(*master));
        }
    }

    let mut events = Vec::new();
    for zone in zones.values_mut() {
        let group = desired.remove(&zone.index).unwrap_or_default();
        let new = ZoneValue::Group(group);
        if let Some(old) = zone.set(new.clone()) {
            events.push(ChangeEvent::Zone {
                index: zone.index,
                field: new.field(),
                old,
                new,
            });
        }
    }
    events
}

/// Drop members that no longer exist after a snapshot
fn prune_groups(zones: &mut BTreeMap<OutputIndex, Zone>) -> Vec<ChangeEvent> {
    let present: BTreeSet<OutputIndex> = zones.keys().copied().collect();
    let mut groups = current_groups(zones);
    for members in groups.values_mut() {
        members.retain(|m| present.contains(m));
    }
    apply_groups(zones, &groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZoneField;

    fn source(index: InputIndex, label: &str) -> Source {
        Source {
            index,
            label: label.to_string(),
            enabled: true,
        }
    }

    fn zone(index: OutputIndex, label: &str, input: Option<InputIndex>) -> Zone {
        Zone {
            index,
            label: label.to_string(),
            enabled: true,
            volume: Some(30),
            muted: false,
            input_channel: input,
            group: GroupState::Ungrouped,
        }
    }

    fn populated() -> (StateCache, crate::subscription::Subscription) {
        let cache = StateCache::new(ChangeBus::new(32));
        cache.apply_snapshot(
            vec![source(1, "TV"), source(2, "Radio")],
            vec![
                zone(1, "Living Room", Some(1)),
                zone(2, "Kitchen", None),
                zone(3, "Patio", None),
            ],
        );
        let sub = cache.bus().subscribe();
        (cache, sub)
    }

    #[test]
    fn snapshot_sets_ready() {
        let cache = StateCache::new(ChangeBus::new(4));
        assert!(!cache.is_ready());
        cache.apply_snapshot(vec![source(1, "TV")], vec![zone(1, "Den", Some(1))]);
        assert!(cache.is_ready());
        assert_eq!(cache.get_output(1).unwrap().input_channel, Some(1));
    }

    #[test]
    fn repeated_delta_notifies_once() {
        let (cache, mut sub) = populated();

        let first = cache.apply_delta(1, ZoneValue::Volume(Some(55))).unwrap();
        let second = cache.apply_delta(1, ZoneValue::Volume(Some(55))).unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(
            sub.try_recv(),
            Some(ChangeEvent::Zone {
                index: 1,
                field: ZoneField::Volume,
                old: ZoneValue::Volume(Some(30)),
                new: ZoneValue::Volume(Some(55)),
            })
        );
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dangling_input_is_treated_as_unassigned() {
        let (cache, _sub) = populated();
        cache.apply_delta(2, ZoneValue::InputChannel(Some(9))).unwrap();
        assert_eq!(cache.get_output(2).unwrap().input_channel, None);

        let cache = StateCache::new(ChangeBus::new(4));
        cache.apply_snapshot(vec![source(1, "TV")], vec![zone(1, "Den", Some(5))]);
        assert_eq!(cache.get_output(1).unwrap().input_channel, None);
    }

    #[test]
    fn unknown_indices_are_not_found() {
        let (cache, _sub) = populated();
        assert!(matches!(
            cache.get_output(42),
            Err(MatrixError::NotFound { kind: "output", index: 42 })
        ));
        assert!(matches!(
            cache.get_input(42),
            Err(MatrixError::NotFound { kind: "input", index: 42 })
        ));
        assert!(cache.apply_delta(42, ZoneValue::Muted(true)).is_err());
    }

    #[test]
    fn reads_are_copies() {
        let (cache, _sub) = populated();
        let mut copy = cache.get_output(1).unwrap();
        copy.volume = Some(99);
        assert_eq!(cache.get_output(1).unwrap().volume, Some(30));
    }

    #[test]
    fn enabled_filters_apply() {
        let cache = StateCache::new(ChangeBus::new(4));
        let mut hidden = source(3, "Spare");
        hidden.enabled = false;
        let mut off = zone(4, "Garage", None);
        off.enabled = false;
        cache.apply_snapshot(
            vec![source(1, "TV"), hidden],
            vec![zone(1, "Den", None), off],
        );
        assert_eq!(cache.enabled_inputs().len(), 1);
        assert_eq!(cache.enabled_outputs().len(), 1);
        assert_eq!(cache.source_directory().index_of("Spare"), None);
    }

    #[test]
    fn label_refresh_updates_directory() {
        let (cache, mut sub) = populated();
        cache.apply_source_label(2, "Vinyl".to_string()).unwrap();

        let directory = cache.source_directory();
        assert_eq!(directory.index_of("Vinyl"), Some(2));
        assert_eq!(directory.index_of("Radio"), None);
        assert_eq!(directory.labels(), vec!["TV".to_string(), "Vinyl".to_string()]);
        assert!(matches!(sub.try_recv(), Some(ChangeEvent::SourceLabel { index: 2, .. })));
    }

    #[test]
    fn join_and_unjoin_maintain_both_sides() {
        let (cache, _sub) = populated();
        cache.join(1, &[2, 3]).unwrap();

        assert_eq!(
            cache.get_output(1).unwrap().group,
            GroupState::Master([2, 3].into_iter().collect())
        );
        assert_eq!(cache.get_output(3).unwrap().group, GroupState::Member(1));

        cache.unjoin(&[3]).unwrap();
        assert_eq!(
            cache.get_output(1).unwrap().group,
            GroupState::Master([2].into_iter().collect())
        );
        assert_eq!(cache.get_output(3).unwrap().group, GroupState::Ungrouped);

        cache.unjoin(&[1]).unwrap();
        assert_eq!(cache.get_output(2).unwrap().group, GroupState::Ungrouped);
    }

    #[test]
    fn joining_moves_member_between_groups() {
        let (cache, _sub) = populated();
        cache.join(1, &[2]).unwrap();
        cache.join(3, &[2]).unwrap();

        assert_eq!(cache.get_output(1).unwrap().group, GroupState::Ungrouped);
        assert_eq!(cache.get_output(2).unwrap().group, GroupState::Member(3));
        assert!(cache.join(1, &[1]).is_err());
    }

    #[test]
    fn snapshot_keeps_groups_of_surviving_outputs() {
        let (cache, _sub) = populated();
        cache.join(1, &[2, 3]).unwrap();
        cache.apply_snapshot(
            vec![source(1, "TV")],
            vec![zone(1, "Living Room", None), zone(2, "Kitchen", None)],
        );
        assert_eq!(
            cache.get_output(1).unwrap().group,
            GroupState::Master([2].into_iter().collect())
        );
        assert_eq!(cache.get_output(2).unwrap().group, GroupState::Member(1));
    }

    #[test]
    fn snapshot_dropping_a_member_notifies_the_master() {
        let (cache, mut sub) = populated();
        cache.join(1, &[2, 3]).unwrap();
        while sub.try_recv().is_some() {}

        cache.apply_snapshot(
            vec![source(1, "TV")],
            vec![zone(1, "Living Room", None), zone(2, "Kitchen", None)],
        );

        assert_eq!(sub.try_recv(), Some(ChangeEvent::Snapshot));
        assert_eq!(
            sub.try_recv(),
            Some(ChangeEvent::Zone {
                index: 1,
                field: ZoneField::Group,
                old: ZoneValue::Group(GroupState::Master([2, 3].into_iter().collect())),
                new: ZoneValue::Group(GroupState::Master([2].into_iter().collect())),
            })
        );
        assert_eq!(sub.try_recv(), None);
    }
}
