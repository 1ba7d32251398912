//! Integration tests for the sync engine.
//!
//! These tests drive whole sessions through the public API: build a tree,
//! render the page, attach transports, fire client events, and assert on
//! the frames the browser would receive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use trellis_core::session::RegistryConfig;
use trellis_core::{
    AppSource, Cell, Error, Handler, Registry, Session, Shutdown, Transport, TransportKind, Tree,
    View,
};

fn registry_for(source: AppSource) -> Arc<Registry> {
    Registry::new(
        source,
        RegistryConfig {
            debug: true,
            ..RegistryConfig::default()
        },
        Shutdown::new(),
    )
}

fn connect(session: &Arc<Session>) -> (u64, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let (transport, rx) = Transport::channel(TransportKind::Primary);
    let id = transport.id();
    session.attach(transport);
    (id, rx)
}

fn click(id: &str) -> trellis_core::ClientEvent {
    trellis_core::ClientEvent {
        id: id.to_string(),
        name: "click".to_string(),
        data: Map::new(),
    }
}

fn next_frame(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Value {
    let raw = rx.try_recv().expect("expected a frame");
    serde_json::from_str(&raw).expect("frame is json")
}

/// A small static tree renders as one self-contained HTML page.
#[test]
fn page_render_covers_the_whole_tree() {
    let tree = Tree::body();
    tree.update(|doc| {
        let root = doc.root();
        let header = doc.create("h1");
        doc.append_text(header, "Trellis");
        let list = doc.create("ul");
        let item = doc.create("li");
        doc.append_text(item, "first");
        doc.append_child(list, item);
        doc.append_child(root, header);
        doc.append_child(root, list);
    });

    let registry = registry_for(AppSource::Shared(tree));
    let session = registry.get_or_create("s1");
    let page = session.render_page().unwrap();

    assert!(page.starts_with("<!DOCTYPE html>"));
    assert!(page.contains(">Trellis</h1>"));
    assert!(page.contains("<ul"));
    assert!(page.contains(">first</li>"));
    assert!(page.contains("window.trellis"));
}

/// Void elements render self-closing, with no closing tag.
#[test]
fn void_elements_render_self_closing() {
    let tree = Tree::body();
    tree.update(|doc| {
        let root = doc.root();
        let rule = doc.create("hr");
        doc.append_child(root, rule);
    });
    let registry = registry_for(AppSource::Shared(tree));
    let page = registry.get_or_create("s1").render_page().unwrap();
    assert!(page.contains("<hr"));
    assert!(!page.contains("</hr>"));
}

/// The counter app: a click increments a cell, and only the observing
/// node comes back in the update frame.
#[tokio::test]
async fn counter_click_updates_only_the_label() {
    let tree = Tree::body();
    let count = Cell::new(0i64);
    let (button_id, label_id) = tree.update(|doc| {
        let root = doc.root();
        let label = doc.create("span");
        let reader = count.clone();
        doc.append_dynamic(label, move |scope| Ok(View::text(reader.get(scope))));
        let button = doc.create("button");
        doc.append_text(button, "+1");
        let bumper = count.clone();
        doc.bind(
            button,
            "click",
            Handler::direct(move |_ev| {
                bumper.update(|v| v + 1);
                Ok(())
            }),
        );
        doc.append_child(root, label);
        doc.append_child(root, button);
        (
            doc.dom_id(button).unwrap().to_string(),
            doc.dom_id(label).unwrap().to_string(),
        )
    });

    let registry = registry_for(AppSource::Shared(tree));
    let session = registry.get_or_create("s1");
    session.render_page().unwrap();
    let (origin, mut rx) = connect(&session);

    session.handle_event(click(&button_id), Some(origin)).await;
    let frame = next_frame(&mut rx);
    assert_eq!(frame["action"], "update");
    let updates = frame["updates"].as_object().unwrap();
    assert_eq!(updates.len(), 1);
    assert!(updates[&label_id].as_str().unwrap().contains('1'));

    session.handle_event(click(&button_id), Some(origin)).await;
    let frame = next_frame(&mut rx);
    assert!(frame["updates"][&label_id].as_str().unwrap().contains('2'));
}

/// A callback's return value resolves the client promise by callback id.
#[tokio::test]
async fn callback_result_travels_with_the_frame() {
    let tree = Tree::body();
    let button_id = tree.update(|doc| {
        let root = doc.root();
        let button = doc.create("button");
        doc.bind(
            button,
            "click",
            Handler::future(|_ev| async move { Ok(Value::from(21 * 2)) }),
        );
        doc.append_child(root, button);
        doc.dom_id(button).unwrap().to_string()
    });

    let registry = registry_for(AppSource::Shared(tree));
    let session = registry.get_or_create("s1");
    session.render_page().unwrap();
    let (origin, mut rx) = connect(&session);

    let mut event = click(&button_id);
    event
        .data
        .insert("callback_id".into(), Value::String("cb42".into()));
    session.handle_event(event, Some(origin)).await;

    let frame = next_frame(&mut rx);
    assert_eq!(frame["callback_id"], "cb42");
    assert_eq!(frame["result"], 42);
}

/// A stepped handler that fails after one yield sends exactly one
/// intermediate update before the error frame.
#[tokio::test]
async fn stepped_failure_stops_after_one_intermediate_frame() {
    let tree = Tree::body();
    let progress = Cell::new(0i64);
    let button_id = tree.update(|doc| {
        let root = doc.root();
        let bar = doc.create("div");
        let reader = progress.clone();
        doc.append_dynamic(bar, move |scope| Ok(View::text(reader.get(scope))));
        let button = doc.create("button");
        let writer = progress.clone();
        doc.bind(
            button,
            "click",
            Handler::stepped(move |_ev, stepper| {
                let writer = writer.clone();
                async move {
                    writer.set(10);
                    stepper.pause().await?;
                    Err::<trellis_core::EventResult, _>(Error::callback("step two failed"))
                }
            }),
        );
        doc.append_child(root, bar);
        doc.append_child(root, button);
        doc.dom_id(button).unwrap().to_string()
    });

    let registry = registry_for(AppSource::Shared(tree));
    let session = registry.get_or_create("s1");
    session.render_page().unwrap();
    let (origin, mut rx) = connect(&session);

    session.handle_event(click(&button_id), Some(origin)).await;

    let intermediate = next_frame(&mut rx);
    assert_eq!(intermediate["action"], "update");
    let html = intermediate["updates"]
        .as_object()
        .unwrap()
        .values()
        .next()
        .unwrap();
    assert!(html.as_str().unwrap().contains("10"));

    let error = next_frame(&mut rx);
    assert_eq!(error["action"], "error");
    assert!(error["traceback"].as_str().unwrap().contains("step two failed"));
    assert!(rx.try_recv().is_err());
}

/// Factory sessions are isolated: clicking in one never reaches the other.
#[tokio::test]
async fn sessions_from_a_factory_are_isolated() {
    let registry = registry_for(AppSource::factory(|| {
        let tree = Tree::body();
        let count = Cell::new(0i64);
        tree.update(|doc| {
            let root = doc.root();
            let label = doc.create("span");
            let reader = count.clone();
            doc.append_dynamic(label, move |scope| Ok(View::text(reader.get(scope))));
            let button = doc.create("button");
            doc.set_attr(button, "class", "bump");
            let bumper = count.clone();
            doc.bind(
                button,
                "click",
                Handler::direct(move |_ev| {
                    bumper.update(|v| v + 1);
                    Ok(())
                }),
            );
            doc.append_child(root, label);
            doc.append_child(root, button);
        });
        tree
    }));

    let alice = registry.get_or_create("alice");
    let bob = registry.get_or_create("bob");
    alice.render_page().unwrap();
    bob.render_page().unwrap();
    let (alice_origin, mut alice_rx) = connect(&alice);
    let (_bob_origin, mut bob_rx) = connect(&bob);

    let alice_button = alice
        .tree()
        .with(|doc| {
            let root = doc.root();
            doc.node(root)
                .unwrap()
                .child_keys()
                .into_iter()
                .find(|k| doc.tag(*k) == Some("button"))
                .map(|k| doc.dom_id(k).unwrap().to_string())
        })
        .unwrap();

    alice
        .handle_event(click(&alice_button), Some(alice_origin))
        .await;

    assert!(alice_rx.try_recv().is_ok());
    assert!(bob_rx.try_recv().is_err());
}

/// Mount and unmount hooks fire exactly once each, however deep the
/// subtree, across attach / detach / reattach.
#[test]
fn lifecycle_hooks_stay_balanced_when_reparenting() {
    let tree = Tree::body();
    let mounts = Arc::new(AtomicUsize::new(0));
    let unmounts = Arc::new(AtomicUsize::new(0));

    let subtree = tree.update(|doc| {
        let outer = doc.create("div");
        let mut parent = outer;
        for _ in 0..5 {
            let child = doc.create("div");
            let m = Arc::clone(&mounts);
            doc.set_on_mount(child, move || {
                m.fetch_add(1, Ordering::SeqCst);
            });
            let u = Arc::clone(&unmounts);
            doc.set_on_unmount(child, move || {
                u.fetch_add(1, Ordering::SeqCst);
            });
            doc.append_child(parent, child);
            parent = child;
        }
        outer
    });

    // Detached: nothing fires.
    assert_eq!(mounts.load(Ordering::SeqCst), 0);

    tree.update(|doc| {
        let root = doc.root();
        doc.append_child(root, subtree);
    });
    assert_eq!(mounts.load(Ordering::SeqCst), 5);
    assert_eq!(unmounts.load(Ordering::SeqCst), 0);

    tree.update(|doc| doc.detach(subtree));
    assert_eq!(unmounts.load(Ordering::SeqCst), 5);

    tree.update(|doc| {
        let root = doc.root();
        doc.append_child(root, subtree);
    });
    assert_eq!(mounts.load(Ordering::SeqCst), 10);
    assert_eq!(unmounts.load(Ordering::SeqCst), 5);
}

/// Statics declared by nodes appear in the page head once, even when
/// several nodes declare the same fragment.
#[test]
fn page_statics_are_deduplicated() {
    let tree = Tree::body();
    tree.update(|doc| {
        let root = doc.root();
        for _ in 0..3 {
            let widget = doc.create("widget");
            doc.push_static(widget, "<style>.widget{color:red}</style>");
            doc.append_child(root, widget);
        }
    });

    let registry = registry_for(AppSource::Shared(tree));
    let page = registry.get_or_create("s1").render_page().unwrap();
    assert_eq!(page.matches("<style>.widget{color:red}</style>").count(), 1);
}

/// Late-created nodes deliver their statics through the update frame.
#[tokio::test]
async fn late_statics_arrive_with_the_update() {
    let tree = Tree::body();
    let button_id = tree.update(|doc| {
        let root = doc.root();
        let button = doc.create("button");
        let tree_root = root;
        doc.bind(
            button,
            "click",
            Handler::direct(move |ev| {
                let _ = (tree_root, &ev);
                Ok(())
            }),
        );
        doc.append_child(root, button);
        doc.dom_id(button).unwrap().to_string()
    });

    let registry = registry_for(AppSource::Shared(tree.clone()));
    let session = registry.get_or_create("s1");
    session.render_page().unwrap();
    let (origin, mut rx) = connect(&session);

    // The handler's effect: a new widget with a static appears.
    tree.update(|doc| {
        let root = doc.root();
        let widget = doc.create("chart");
        doc.push_static(widget, "<script>chart()</script>");
        doc.append_child(root, widget);
    });
    session.handle_event(click(&button_id), Some(origin)).await;

    let frame = next_frame(&mut rx);
    let statics = frame["statics"].as_array().unwrap();
    assert_eq!(statics.len(), 1);
    assert!(statics[0].as_str().unwrap().contains("chart()"));
}
