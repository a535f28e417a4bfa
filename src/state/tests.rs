use super::*;
use crate::entity::{Capability, EntityId, Lifecycle};
use crate::error::GraphError;
use crate::event::sensors::{CHILD_ADDED, CONTAINER, LIFECYCLE, MEMBER_REMOVED};
use crate::event::{AttributeSensor, EventSensor, SensorEvent};
use crate::registry::{types, TypeRegistry};
use crate::subscription::{BusConfig, EventBus, SensorEventListener, SensorFilter, SourceFilter};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::runtime::Handle;

fn new_graph() -> Arc<EntityGraph> {
    let bus = Arc::new(EventBus::new(Handle::current(), BusConfig::default()));
    Arc::new(EntityGraph::new(
        bus,
        Arc::new(TypeRegistry::with_builtin_types()),
    ))
}

fn create(graph: &EntityGraph, entity_type: &str) -> EntityId {
    graph.create_entity(entity_type, ConfigMap::new()).unwrap()
}

fn recorder() -> (Arc<Mutex<Vec<SensorEvent>>>, Arc<dyn SensorEventListener>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: Arc<dyn SensorEventListener> = Arc::new(move |event: &SensorEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (seen, handler)
}

const LOAD: AttributeSensor<f64> = AttributeSensor::new("cpu.load");
const RESTARTED: EventSensor<u32> = EventSensor::new("service.restarted");

#[tokio::test]
async fn test_create_entity() {
    let graph = new_graph();
    let id = create(&graph, types::APPLICATION);

    let entity = graph.entity(id).unwrap();
    assert_eq!(entity.id, id);
    assert_eq!(entity.entity_type.as_str(), "application");
    assert_eq!(entity.lifecycle, Lifecycle::Constructing);
    assert!(entity.has(Capability::HasChildren));
    assert!(!entity.has(Capability::Group));
    assert_eq!(graph.attribute(id, &LIFECYCLE).unwrap(), Some(Lifecycle::Constructing));
}

#[tokio::test]
async fn test_create_unknown_type() {
    let graph = new_graph();
    let err = graph.create_entity("webserver", ConfigMap::new()).unwrap_err();
    assert_eq!(err, GraphError::UnknownType("webserver".to_string()));
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let graph = new_graph();
    let ghost = EntityId::generate();
    assert_eq!(graph.lifecycle(ghost), Err(GraphError::NotFound(ghost)));
    assert!(graph.children(ghost).is_err());
}

#[tokio::test]
async fn test_adopt_records_edges() {
    let graph = new_graph();
    let app = create(&graph, types::APPLICATION);
    let web = create(&graph, types::SERVICE);
    let db = create(&graph, types::SERVICE);

    graph.adopt(app, web).unwrap();
    graph.adopt(app, db).unwrap();

    assert_eq!(graph.children(app).unwrap(), vec![web, db]);
    assert_eq!(graph.parent(web).unwrap(), Some(app));
    assert_eq!(graph.parent(app).unwrap(), None);
}

#[tokio::test]
async fn test_adopt_rejects_bad_topology() {
    let graph = new_graph();
    let a = create(&graph, types::APPLICATION);
    let b = create(&graph, types::SERVICE);
    let c = create(&graph, types::SERVICE);
    let item = create(&graph, types::ITEM);

    graph.adopt(a, b).unwrap();
    graph.adopt(b, c).unwrap();

    // Self adoption
    assert!(matches!(graph.adopt(a, a), Err(GraphError::InvalidTopology(_))));
    // Cycle
    assert!(matches!(graph.adopt(c, a), Err(GraphError::InvalidTopology(_))));
    // Duplicate parent
    assert!(matches!(graph.adopt(a, c), Err(GraphError::InvalidTopology(_))));
    // Items cannot have children
    assert!(matches!(
        graph.adopt(item, create(&graph, types::ITEM)),
        Err(GraphError::MissingCapability { .. })
    ));

    // Graph unchanged
    assert_eq!(graph.children(a).unwrap(), vec![b]);
    assert_eq!(graph.parent(c).unwrap(), Some(b));
}

#[tokio::test]
async fn test_adopt_destroyed_endpoint() {
    let graph = new_graph();
    let app = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    graph.destroy(svc, DestroyMode::Recursive).unwrap();

    assert!(matches!(graph.adopt(app, svc), Err(GraphError::InvalidTopology(_))));
}

#[tokio::test]
async fn test_activation_requires_managed_parent() {
    let graph = new_graph();
    let app = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();

    let err = graph.activate(svc).unwrap_err();
    assert_eq!(
        err,
        GraphError::NotReady {
            entity: svc,
            parent: app,
            parent_state: Lifecycle::Constructing,
        }
    );

    graph.activate(app).unwrap();
    graph.activate(svc).unwrap();
    assert_eq!(graph.lifecycle(svc).unwrap(), Lifecycle::Managed);
}

#[tokio::test]
async fn test_activate_is_idempotent() {
    let graph = new_graph();
    let observer = create(&graph, types::APPLICATION);
    let app = create(&graph, types::APPLICATION);
    graph.activate(observer).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(observer, SourceFilter::Entity(app), SensorFilter::of(&LIFECYCLE), handler)
        .unwrap();

    graph.activate(app).unwrap();
    graph.activate(app).unwrap();
    graph.bus().quiesce().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value_as::<Lifecycle>(), Some(Lifecycle::Managed));
}

#[tokio::test]
async fn test_attribute_set_publishes_once_per_change() {
    let graph = new_graph();
    let observer = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    graph.activate(observer).unwrap();
    graph.activate(svc).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(observer, SourceFilter::Entity(svc), SensorFilter::of(&LOAD), handler)
        .unwrap();

    assert_eq!(graph.set_attribute(svc, &LOAD, 0.5).unwrap(), None);
    assert_eq!(graph.set_attribute(svc, &LOAD, 0.5).unwrap(), Some(0.5));
    assert_eq!(graph.set_attribute(svc, &LOAD, 0.7).unwrap(), Some(0.5));
    graph.bus().quiesce().await;

    let values: Vec<f64> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| e.value_as::<f64>())
        .collect();
    assert_eq!(values, vec![0.5, 0.7]);
    assert_eq!(graph.attribute(svc, &LOAD).unwrap(), Some(0.7));
}

#[tokio::test]
async fn test_unmanaged_entity_stores_silently() {
    let graph = new_graph();
    let observer = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    graph.activate(observer).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(observer, SourceFilter::Entity(svc), SensorFilter::Any, handler)
        .unwrap();

    graph.set_attribute(svc, &LOAD, 0.9).unwrap();
    graph.emit(svc, &RESTARTED, 1).unwrap();
    graph.bus().quiesce().await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(graph.attribute(svc, &LOAD).unwrap(), Some(0.9));
}

#[tokio::test]
async fn test_emit_from_managed_entity() {
    let graph = new_graph();
    let observer = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    graph.activate(observer).unwrap();
    graph.activate(svc).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(observer, SourceFilter::Any, SensorFilter::of(&RESTARTED), handler)
        .unwrap();

    graph.emit(svc, &RESTARTED, 3).unwrap();
    graph.bus().quiesce().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].source, svc);
    assert_eq!(seen[0].value_as::<u32>(), Some(3));
    // Event sensors keep no value
    assert_eq!(graph.attribute_value(svc, "service.restarted").unwrap(), None);
}

#[tokio::test]
async fn test_dormant_subscription_goes_live_on_activation() {
    let graph = new_graph();
    let observer = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    graph.activate(svc).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(observer, SourceFilter::Entity(svc), SensorFilter::of(&LOAD), handler)
        .unwrap();

    graph.set_attribute(svc, &LOAD, 1.0).unwrap();
    graph.bus().quiesce().await;
    assert!(seen.lock().unwrap().is_empty());

    graph.activate(observer).unwrap();
    graph.set_attribute(svc, &LOAD, 2.0).unwrap();
    graph.bus().quiesce().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_config_resolution_order() {
    let graph = new_graph();
    let region: ConfigKey<String> = ConfigKey::new("deploy.region", "us-east-1".to_string());
    let port: ConfigKey<u16> = ConfigKey::new("http.port", 8080).not_inherited();

    let app = graph
        .create_entity(
            types::APPLICATION,
            ConfigMap::new()
                .with(&region, "eu-west-1".to_string())
                .with(&port, 9000),
        )
        .unwrap();
    let svc = create(&graph, types::SERVICE);
    let orphan = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();

    // Inherited at adoption
    assert_eq!(graph.config(svc, &region).unwrap(), "eu-west-1");
    // Non-inheritable key falls back to default
    assert_eq!(graph.config(svc, &port).unwrap(), 8080);
    assert_eq!(graph.config(app, &port).unwrap(), 9000);
    // No parent, no override
    assert_eq!(graph.config(orphan, &region).unwrap(), "us-east-1");

    // Own override wins
    graph.set_config(svc, &region, "ap-south-1".to_string()).unwrap();
    assert_eq!(graph.config(svc, &region).unwrap(), "ap-south-1");
}

#[tokio::test]
async fn test_inherited_config_is_a_copy() {
    let graph = new_graph();
    let region: ConfigKey<String> = ConfigKey::new("deploy.region", "us-east-1".to_string());

    let app = graph
        .create_entity(
            types::APPLICATION,
            ConfigMap::new().with(&region, "eu-west-1".to_string()),
        )
        .unwrap();
    let svc = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();

    // Later parent change does not reach the copied value
    graph.set_config(app, &region, "eu-central-1".to_string()).unwrap();
    assert_eq!(graph.config(svc, &region).unwrap(), "eu-west-1");

    // Clearing the copy resolves against the live parent
    graph.clear_inherited_config(svc).unwrap();
    assert_eq!(graph.config(svc, &region).unwrap(), "eu-central-1");
}

#[tokio::test]
async fn test_config_inherits_through_grandparent() {
    let graph = new_graph();
    let tier: ConfigKey<String> = ConfigKey::new("deploy.tier", "dev".to_string());

    let app = graph
        .create_entity(types::APPLICATION, ConfigMap::new().with(&tier, "prod".to_string()))
        .unwrap();
    let svc = create(&graph, types::SERVICE);
    let worker = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();
    graph.adopt(svc, worker).unwrap();

    assert_eq!(graph.config(worker, &tier).unwrap(), "prod");
    let entity = graph.entity(worker).unwrap();
    assert!(entity.config.inherited().contains_key("deploy.tier"));
}

#[tokio::test]
async fn test_destroy_recursive() {
    let graph = new_graph();
    let app = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    let worker = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();
    graph.adopt(svc, worker).unwrap();

    graph.destroy(svc, DestroyMode::Recursive).unwrap();

    assert_eq!(graph.lifecycle(svc).unwrap(), Lifecycle::Destroyed);
    assert_eq!(graph.lifecycle(worker).unwrap(), Lifecycle::Destroyed);
    assert!(graph.children(app).unwrap().is_empty());
    assert_eq!(graph.ids(), vec![app]);
    // Tombstones stay addressable
    assert!(graph.contains(svc));
}

#[tokio::test]
async fn test_destroy_orphans_children() {
    let graph = new_graph();
    let app = create(&graph, types::APPLICATION);
    let svc = create(&graph, types::SERVICE);
    let worker = create(&graph, types::SERVICE);
    let root_svc = create(&graph, types::SERVICE);
    let root_worker = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();
    graph.adopt(svc, worker).unwrap();
    graph.adopt(root_svc, root_worker).unwrap();

    graph.destroy(svc, DestroyMode::OrphanChildren).unwrap();
    graph.destroy(root_svc, DestroyMode::OrphanChildren).unwrap();

    assert_eq!(graph.parent(worker).unwrap(), Some(app));
    assert_eq!(graph.children(app).unwrap(), vec![worker]);
    assert_eq!(graph.parent(root_worker).unwrap(), None);
    assert_eq!(graph.lifecycle(worker).unwrap(), Lifecycle::Constructing);
}

#[tokio::test]
async fn test_destroy_leaves_groups_and_prunes_subscriptions() {
    let graph = new_graph();
    let group = create(&graph, types::GROUP);
    let item = create(&graph, types::ITEM);
    let other = create(&graph, types::APPLICATION);
    graph.activate(group).unwrap();
    graph.activate(item).unwrap();
    graph.activate(other).unwrap();

    graph.add_member(group, item).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(other, SourceFilter::Entity(group), SensorFilter::of(&MEMBER_REMOVED), handler)
        .unwrap();
    let (_, item_handler) = recorder();
    graph
        .subscribe(item, SourceFilter::Any, SensorFilter::Any, item_handler)
        .unwrap();
    let (_, watcher) = recorder();
    graph
        .subscribe(other, SourceFilter::Entity(item), SensorFilter::Any, watcher)
        .unwrap();
    assert_eq!(graph.bus().subscription_count(), 3);

    graph.destroy(item, DestroyMode::Recursive).unwrap();
    graph.bus().quiesce().await;

    assert!(!graph.has_member(group, item).unwrap());
    assert_eq!(graph.bus().subscription_count(), 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value_as::<EntityId>(), Some(item));
}

#[tokio::test]
async fn test_destroyed_group_announces_departures() {
    let graph = new_graph();
    let group = create(&graph, types::GROUP);
    let a = create(&graph, types::ITEM);
    let b = create(&graph, types::ITEM);
    let watcher = create(&graph, types::APPLICATION);
    for id in [group, a, b, watcher] {
        graph.activate(id).unwrap();
    }
    graph.add_member(group, a).unwrap();
    graph.add_member(group, b).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(watcher, SourceFilter::Any, SensorFilter::of(&LIFECYCLE), handler)
        .unwrap();

    graph.destroy(group, DestroyMode::Recursive).unwrap();
    graph.bus().quiesce().await;

    assert!(graph.entity(a).unwrap().member_of.is_empty());
    assert!(graph.entity(b).unwrap().member_of.is_empty());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].source, group);
    assert_eq!(seen[0].value_as::<Lifecycle>(), Some(Lifecycle::Stopping));
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let graph = new_graph();
    let svc = create(&graph, types::SERVICE);
    graph.destroy(svc, DestroyMode::Recursive).unwrap();
    graph.destroy(svc, DestroyMode::Recursive).unwrap();
    assert!(matches!(graph.activate(svc), Err(GraphError::InvalidTopology(_))));
}

#[tokio::test]
async fn test_membership_edges() {
    let graph = new_graph();
    let group = create(&graph, types::GROUP);
    let item = create(&graph, types::ITEM);
    let svc = create(&graph, types::SERVICE);

    assert!(graph.add_member(group, item).unwrap());
    assert!(!graph.add_member(group, item).unwrap());
    assert!(graph.has_member(group, item).unwrap());
    assert_eq!(graph.members(group).unwrap(), vec![item]);
    assert!(graph.entity(item).unwrap().member_of.contains(&group));

    // Only groups hold members
    assert!(matches!(
        graph.add_member(svc, item),
        Err(GraphError::MissingCapability { .. })
    ));

    assert!(graph.remove_member(group, item).unwrap());
    assert!(!graph.remove_member(group, item).unwrap());
    assert!(graph.entity(item).unwrap().member_of.is_empty());
}

#[tokio::test]
async fn test_locations() {
    let graph = new_graph();
    let dc = create(&graph, types::LOCATION);
    let svc = create(&graph, types::SERVICE);
    let other = create(&graph, types::SERVICE);

    assert!(graph.add_location(svc, dc).unwrap());
    assert_eq!(graph.locations(svc).unwrap(), vec![dc]);
    assert!(matches!(
        graph.add_location(svc, other),
        Err(GraphError::MissingCapability { .. })
    ));

    graph.destroy(dc, DestroyMode::Recursive).unwrap();
    assert!(graph.locations(svc).unwrap().is_empty());
}

#[tokio::test]
async fn test_child_added_emitted_by_managed_parent() {
    let graph = new_graph();
    let app = create(&graph, types::APPLICATION);
    let observer = create(&graph, types::APPLICATION);
    graph.activate(app).unwrap();
    graph.activate(observer).unwrap();

    let (seen, handler) = recorder();
    graph
        .subscribe(observer, SourceFilter::Entity(app), SensorFilter::of(&CHILD_ADDED), handler)
        .unwrap();

    let svc = create(&graph, types::SERVICE);
    graph.adopt(app, svc).unwrap();
    graph.bus().quiesce().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value_as::<EntityId>(), Some(svc));
}

#[tokio::test]
async fn test_queries() {
    let graph = new_graph();
    let group = create(&graph, types::GROUP);
    let item1 = create(&graph, types::ITEM);
    let item2 = create(&graph, types::ITEM);
    graph.activate(item1).unwrap();

    let mut movable = vec![item1, item2];
    movable.sort();
    assert_eq!(graph.with_capability(Capability::Movable), movable);
    assert_eq!(graph.managed_ids(), vec![item1]);
    assert_eq!(graph.ids().len(), 3);
    assert_eq!(graph.get_all_entities().len(), 3);
    assert!(graph.has_capability(group, Capability::Group).unwrap());

    graph.set_attribute(item1, &CONTAINER, Some(group)).unwrap();
    assert_eq!(graph.attribute(item1, &CONTAINER).unwrap(), Some(Some(group)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adoption_keeps_tree_consistent() {
    let graph = new_graph();
    let roots: Vec<EntityId> = (0..4).map(|_| create(&graph, types::APPLICATION)).collect();
    let children: Vec<EntityId> = (0..200).map(|_| create(&graph, types::SERVICE)).collect();

    // Every child is fought over by all roots; exactly one adoption may win
    let mut handles = vec![];
    for root in roots.clone() {
        let graph = graph.clone();
        let children = children.clone();
        handles.push(thread::spawn(move || {
            children
                .iter()
                .filter(|child| graph.adopt(root, **child).is_ok())
                .count()
        }));
    }

    let adopted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(adopted, children.len());

    let listed: usize = roots.iter().map(|r| graph.children(*r).unwrap().len()).sum();
    assert_eq!(listed, children.len());
    for child in &children {
        let parent = graph.parent(*child).unwrap().unwrap();
        assert!(graph.children(parent).unwrap().contains(child));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cross_adoption_never_cycles() {
    let graph = new_graph();

    // Pairs adopted both ways at once; at most one direction may succeed
    for _ in 0..50 {
        let a = create(&graph, types::SERVICE);
        let b = create(&graph, types::SERVICE);
        let g1 = graph.clone();
        let g2 = graph.clone();
        let t1 = thread::spawn(move || g1.adopt(a, b).is_ok());
        let t2 = thread::spawn(move || g2.adopt(b, a).is_ok());
        let (r1, r2) = (t1.join().unwrap(), t2.join().unwrap());

        assert!(r1 ^ r2);
        assert!(graph.parent(a).unwrap().is_none() || graph.parent(b).unwrap().is_none());
    }
}
