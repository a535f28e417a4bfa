use super::*;
use crate::entity::{EntityId, Lifecycle};
use crate::error::RebindError;
use crate::registry::{types, TypeRegistry};
use crate::state::{ConfigKey, DestroyMode};
use crate::subscription::{BusConfig, EventBus};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Handle;

fn new_graph() -> Arc<EntityGraph> {
    let bus = Arc::new(EventBus::new(Handle::current(), BusConfig::default()));
    Arc::new(EntityGraph::new(
        bus,
        Arc::new(TypeRegistry::with_builtin_types()),
    ))
}

fn memento(entity_type: &str) -> EntityMemento {
    EntityMemento {
        id: EntityId::generate(),
        entity_type: EntityType::new(entity_type),
        config: BTreeMap::new(),
        inherited_config: BTreeMap::new(),
        attributes: BTreeMap::new(),
        parent: None,
        children: vec![],
        locations: vec![],
        members: vec![],
        policies: vec![],
    }
}

fn set_of(mementos: Vec<EntityMemento>) -> SnapshotSet {
    SnapshotSet {
        manifest: Manifest {
            schema_version: SCHEMA_VERSION,
            created_at: Utc::now(),
            entity_ids: mementos.iter().map(|m| m.id).collect(),
        },
        mementos,
    }
}

#[test]
fn test_memento_serialize_deserialize_roundtrip() {
    let mut original = memento("service");
    original
        .config
        .insert("deploy.region".to_string(), ConfigValue::new(json!("eu-west-1"), true));
    original.attributes.insert("cpu.load".to_string(), json!(0.5));
    original.children = vec![EntityId::generate(), EntityId::generate()];
    original.policies.push(PolicyDescriptor {
        policy_type: "policy.items_in_containers".to_string(),
        state: json!({ "container_group": null }),
    });

    let json = serde_json::to_string(&original).expect("Serialization failed");
    let deserialized: EntityMemento = serde_json::from_str(&json).expect("Deserialization failed");

    assert_eq!(deserialized, original);
}

#[test]
fn test_memento_missing_optional_fields() {
    let id = EntityId::generate();
    let json = format!(r#"{{"id":"{}","entity_type":"item","parent":null}}"#, id);
    let memento: EntityMemento = serde_json::from_str(&json).unwrap();

    assert_eq!(memento.id, id);
    assert!(memento.children.is_empty());
    assert!(memento.policies.is_empty());
}

#[tokio::test]
async fn test_capture_only_managed_entities() {
    let graph = new_graph();
    let region: ConfigKey<String> = ConfigKey::new("deploy.region", "us-east-1".to_string());

    let app = graph
        .create_entity(
            types::APPLICATION,
            ConfigMap::new().with(&region, "eu-west-1".to_string()),
        )
        .unwrap();
    let svc = graph.create_entity(types::SERVICE, ConfigMap::new()).unwrap();
    let pending = graph.create_entity(types::SERVICE, ConfigMap::new()).unwrap();
    let gone = graph.create_entity(types::SERVICE, ConfigMap::new()).unwrap();
    graph.adopt(app, svc).unwrap();
    graph.activate(app).unwrap();
    graph.activate(svc).unwrap();
    graph.activate(gone).unwrap();
    graph.destroy(gone, DestroyMode::Recursive).unwrap();

    let set = SnapshotSet::capture(&graph);
    let mut expected = vec![app, svc];
    expected.sort();
    assert_eq!(set.manifest.entity_ids, expected);
    assert!(!set.manifest.entity_ids.contains(&pending));

    let svc_memento = set.mementos.iter().find(|m| m.id == svc).unwrap();
    assert_eq!(svc_memento.parent, Some(app));
    assert!(svc_memento.inherited_config.contains_key("deploy.region"));
    // Lifecycle is re-announced on activation, never persisted
    assert!(!svc_memento.attributes.contains_key("lifecycle"));
    assert_eq!(graph.lifecycle(svc).unwrap(), Lifecycle::Managed);
}

#[tokio::test]
async fn test_capture_drops_edges_to_unmanaged_entities() {
    let graph = new_graph();
    let app = graph.create_entity(types::APPLICATION, ConfigMap::new()).unwrap();
    let group = graph.create_entity(types::GROUP, ConfigMap::new()).unwrap();
    let ready = graph.create_entity(types::ITEM, ConfigMap::new()).unwrap();
    graph.activate(app).unwrap();
    graph.activate(group).unwrap();
    graph.activate(ready).unwrap();

    // Adopted and enrolled, but never activated
    let pending_child = graph.create_entity(types::SERVICE, ConfigMap::new()).unwrap();
    let pending_member = graph.create_entity(types::ITEM, ConfigMap::new()).unwrap();
    graph.adopt(app, pending_child).unwrap();
    graph.add_member(group, pending_member).unwrap();
    graph.add_member(group, ready).unwrap();

    let set = SnapshotSet::capture(&graph);

    let app_memento = set.mementos.iter().find(|m| m.id == app).unwrap();
    assert!(app_memento.children.is_empty());
    let group_memento = set.mementos.iter().find(|m| m.id == group).unwrap();
    assert_eq!(group_memento.members, vec![ready]);
    // The live graph keeps its edges
    assert_eq!(graph.children(app).unwrap(), vec![pending_child]);
}

#[test]
fn test_store_layout() {
    let temp_dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp_dir.path());
    let set = set_of(vec![memento("service"), memento("item")]);

    let path = store.write(&set).unwrap();

    assert!(path.join("manifest.json").is_file());
    for id in &set.manifest.entity_ids {
        assert!(path.join("mementos").join(format!("{}.json.gz", id)).is_file());
    }

    // No staging directory left behind
    let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());

    let loaded = store.load(&path).unwrap();
    assert_eq!(loaded.manifest, set.manifest);
    for ((id, outcome), original) in loaded.mementos.iter().zip(&set.mementos) {
        assert_eq!(*id, original.id);
        assert_eq!(outcome.as_ref().unwrap(), original);
    }
}

#[test]
fn test_store_reports_unreadable_memento() {
    let temp_dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp_dir.path());
    let set = set_of(vec![memento("service"), memento("service")]);
    let broken = set.mementos[1].id;

    let path = store.write(&set).unwrap();
    fs::write(
        path.join("mementos").join(format!("{}.json.gz", broken)),
        b"not a gzip file",
    )
    .unwrap();

    let loaded = store.load(&path).unwrap();
    assert!(loaded.mementos[0].1.is_ok());
    assert_eq!(loaded.mementos[1].0, broken);
    assert!(loaded.mementos[1].1.is_err());
}

#[test]
fn test_store_rejects_memento_with_wrong_id() {
    let temp_dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp_dir.path());
    let set = set_of(vec![memento("service")]);
    let path = store.write(&set).unwrap();

    // Overwrite with a memento claiming another id
    let impostor = memento("service");
    let file = fs::File::create(
        path.join("mementos")
            .join(format!("{}.json.gz", set.mementos[0].id)),
    )
    .unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder
        .write_all(&serde_json::to_vec(&impostor).unwrap())
        .unwrap();
    encoder.finish().unwrap();

    assert!(store.read_memento(&path, set.mementos[0].id).is_err());
}

#[test]
fn test_missing_manifest_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp_dir.path());
    let dir = temp_dir.path().join("snapshot-20260212T100000.000Z");
    fs::create_dir_all(&dir).unwrap();

    assert!(matches!(store.load(&dir), Err(RebindError::SnapshotCorrupt(_))));
}

#[test]
fn test_cleanup_keeps_newest() {
    let temp_dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp_dir.path());

    let paths: Vec<_> = (0..4)
        .map(|_| store.write(&set_of(vec![memento("service")])).unwrap())
        .collect();

    assert_eq!(store.cleanup(2).unwrap(), 2);
    assert_eq!(store.list_snapshots().unwrap(), paths[2..].to_vec());
    assert_eq!(store.cleanup(2).unwrap(), 0);
}

#[test]
fn test_same_millisecond_names_sort_in_write_order() {
    let timestamp = "20260212T153045.123Z";
    let names: Vec<String> = (0..25).map(|n| store::snapshot_dir_name(timestamp, n)).collect();
    assert_eq!(names[0], "snapshot-20260212T153045.123Z");
    assert_eq!(names[12], "snapshot-20260212T153045.123Z-0012");

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(sorted, names);
}

#[test]
fn test_rapid_writes_list_in_write_order() {
    let temp_dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(temp_dir.path());

    let paths: Vec<_> = (0..25)
        .map(|_| store.write(&set_of(vec![memento("service")])).unwrap())
        .collect();

    assert_eq!(store.list_snapshots().unwrap(), paths);
}

#[test]
fn test_rebind_state_busy() {
    assert!(!RebindState::Idle.is_busy());
    assert!(!RebindState::Failed.is_busy());
    assert!(RebindState::Loading.is_busy());
    assert!(RebindState::Activating.is_busy());
    assert_eq!(RebindState::Snapshotting.to_string(), "snapshotting");
}
