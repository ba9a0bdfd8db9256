//! Integration tests for the secure overlay facade.
//!
//! These tests exercise the public interface end to end on an isolated
//! single-node overlay: certificate self-announcement, signed publication
//! with monotonic edits, encrypted delivery, and the incoming filter that
//! shields subscribers from hostile values.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use veilmesh::{
    generate_identity, DhtBackend, Identity, InfoHash, MemoryDht, SecureNode, Value,
    ValueCallback, CERTIFICATE_TYPE, MIN_KEY_BITS, USER_DATA,
};

fn alice() -> Identity {
    static ID: OnceLock<Identity> = OnceLock::new();
    ID.get_or_init(|| generate_identity("alice", None, MIN_KEY_BITS).expect("identity failed"))
        .clone()
}

fn bob() -> Identity {
    static ID: OnceLock<Identity> = OnceLock::new();
    ID.get_or_init(|| generate_identity("bob", None, MIN_KEY_BITS).expect("identity failed"))
        .clone()
}

fn carol() -> Identity {
    static ID: OnceLock<Identity> = OnceLock::new();
    ID.get_or_init(|| generate_identity("carol", None, MIN_KEY_BITS).expect("identity failed"))
        .clone()
}

/// A shared single-node overlay the test participants all talk to.
fn shared_backend() -> Arc<MemoryDht> {
    Arc::new(MemoryDht::new(InfoHash::random()))
}

async fn join(dht: &Arc<MemoryDht>, identity: Identity) -> SecureNode<MemoryDht> {
    SecureNode::with_backend(dht.clone(), Some(identity))
        .await
        .expect("node construction failed")
}

fn collecting_callback(sink: &Arc<Mutex<Vec<Arc<Value>>>>) -> ValueCallback {
    let sink = sink.clone();
    Box::new(move |values| {
        sink.lock().expect("sink poisoned").extend_from_slice(values);
        true
    })
}

#[tokio::test]
async fn self_announce_publishes_certificate() {
    let node = SecureNode::standalone(Some(alice())).await.expect("node failed");
    let self_id = node.id();

    let values = node
        .get_values(self_id, Some(Value::type_filter(CERTIFICATE_TYPE)))
        .await
        .expect("get failed");

    assert_eq!(values.len(), 1, "exactly one certificate value expected");
    let cert = veilmesh::Certificate::from_bytes(&values[0].data).expect("certificate parse failed");
    assert_eq!(cert.id(), self_id);
}

#[tokio::test]
async fn find_certificate_for_self_is_local() {
    let node = SecureNode::standalone(Some(alice())).await.expect("node failed");

    // Resolves even though nothing can be fetched from an empty overlay
    // beyond the self-announce: the local certificate answers directly.
    let cert = node.find_certificate(&node.id()).await.expect("self resolution failed");
    assert_eq!(cert.id(), alice().certificate().id());
    assert!(node.cached_certificate(&node.id()).is_some());
}

#[tokio::test]
async fn signed_put_with_monotonic_edit() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;
    let key = InfoHash::get(b"room");

    let first = Value::with_id(USER_DATA, b"hi".to_vec(), 42);
    assert!(node.put_signed(key, first).await.expect("first put failed"));

    let second = Value::with_id(USER_DATA, b"bye".to_vec(), 42);
    assert!(node.put_signed(key, second).await.expect("second put failed"));

    let values = node.get_values(key, None).await.expect("get failed");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].data, b"bye");
    assert_eq!(values[0].seq, 2);
    assert_eq!(
        values[0].owner.as_ref().expect("owner missing").id(),
        alice().private_key().public_key().id()
    );
}

#[tokio::test]
async fn foreign_owner_cannot_replace_signed_value() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;
    let key = InfoHash::get(b"room");

    let value = Value::with_id(USER_DATA, b"hi".to_vec(), 42);
    assert!(node.put_signed(key, value).await.expect("put failed"));

    // A malicious node forwards its own signed value under the same id
    // with a competing sequence number.
    let mut forged = Value::with_id(USER_DATA, b"mine now".to_vec(), 42);
    forged.seq = 2;
    veilmesh::sign_value(carol().private_key(), &mut forged).expect("sign failed");
    assert!(!dht.ingest(key, forged, InfoHash::random()));

    let values = node.get_values(key, None).await.expect("get failed");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].data, b"hi");
    assert_eq!(
        values[0].owner.as_ref().expect("owner missing").id(),
        alice().private_key().public_key().id()
    );
}

#[tokio::test]
async fn stale_sequence_number_is_rejected() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;
    let key = InfoHash::get(b"room");

    let mut value = Value::with_id(USER_DATA, b"v3".to_vec(), 7);
    value.seq = 3;
    assert!(node.put_signed(key, value).await.expect("put failed"));

    // Replaying an older, correctly signed state must not roll back.
    let mut stale = Value::with_id(USER_DATA, b"v1".to_vec(), 7);
    stale.seq = 1;
    veilmesh::sign_value(alice().private_key(), &mut stale).expect("sign failed");
    assert!(!dht.ingest(key, stale, InfoHash::random()));

    let values = node.get_values(key, None).await.expect("get failed");
    assert_eq!(values[0].data, b"v3");
}

#[tokio::test]
async fn identical_reannounce_at_same_seq_is_accepted() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;
    let key = InfoHash::get(b"room");

    let value = Value::with_id(USER_DATA, b"hi".to_vec(), 42);
    assert!(node.put_signed(key, value).await.expect("put failed"));

    let stored = node.get_values(key, None).await.expect("get failed");
    let announced = (*stored[0]).clone();

    // A forwarder re-announces the byte-identical value.
    assert!(dht.ingest(key, announced, InfoHash::random()));
}

#[tokio::test]
async fn encrypted_delivery_reaches_only_the_recipient() {
    let dht = shared_backend();
    let alice_node = join(&dht, alice()).await;
    let bob_node = join(&dht, bob()).await;
    let carol_node = join(&dht, carol()).await;

    let inbox = InfoHash::get(b"inbox:bob");
    let sent = alice_node
        .put_encrypted(inbox, bob_node.id(), Value::new(USER_DATA, b"secret".to_vec()))
        .await
        .expect("put_encrypted failed");
    assert!(sent);

    // On the wire the value is opaque.
    let raw = Arc::new(Mutex::new(Vec::new()));
    let sink = raw.clone();
    dht.get(
        inbox,
        Box::new(move |values: &[Arc<Value>]| {
            sink.lock().expect("sink poisoned").extend_from_slice(values);
            true
        }),
        None,
    )
    .await
    .expect("raw get failed");
    {
        let raw = raw.lock().expect("sink poisoned");
        assert_eq!(raw.len(), 1);
        assert!(raw[0].is_encrypted());
        assert!(raw[0].data.is_empty());
        assert!(raw[0].owner.is_none());
    }

    // Bob observes the plaintext, authenticated as Alice's.
    let values = bob_node.get_values(inbox, None).await.expect("bob get failed");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].data, b"secret");
    assert_eq!(values[0].recipient, Some(bob_node.id()));
    assert_eq!(
        values[0].owner.as_ref().expect("owner missing").id(),
        alice().private_key().public_key().id()
    );

    // Carol observes nothing, and no error is raised.
    let values = carol_node.get_values(inbox, None).await.expect("carol get failed");
    assert!(values.is_empty());
}

#[tokio::test]
async fn put_encrypted_to_unknown_recipient_fails_without_publishing() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;
    let inbox = InfoHash::get(b"inbox:nobody");

    let sent = node
        .put_encrypted(inbox, InfoHash::get(b"nobody"), Value::new(USER_DATA, b"x".to_vec()))
        .await
        .expect("put_encrypted errored");
    assert!(!sent);

    let values = node.get_values(inbox, None).await.expect("get failed");
    assert!(values.is_empty());
}

#[tokio::test]
async fn tampered_signature_is_dropped_by_listen() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;

    // An unregistered type keeps the storage node out of the way so the
    // client-side filter is what gets exercised.
    const RAW_TYPE: u16 = 42;
    let key = InfoHash::get(b"feed");

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    node.listen(
        key,
        Box::new(move |values| {
            counter.fetch_add(values.len(), Ordering::SeqCst);
            true
        }),
        None,
    );

    let mut tampered = Value::with_id(RAW_TYPE, b"payload".to_vec(), 9);
    veilmesh::sign_value(carol().private_key(), &mut tampered).expect("sign failed");
    tampered.signature[0] ^= 1;
    assert!(dht.ingest(key, tampered, InfoHash::random()));

    // Stored, but never surfaced to the subscriber.
    assert_eq!(deliveries.load(Ordering::SeqCst), 0);

    // A valid value on the same subscription still arrives.
    let mut valid = Value::with_id(RAW_TYPE, b"payload".to_vec(), 10);
    veilmesh::sign_value(carol().private_key(), &mut valid).expect("sign failed");
    assert!(dht.ingest(key, valid, InfoHash::random()));
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listen_delivers_decrypted_values_as_they_arrive() {
    let dht = shared_backend();
    let alice_node = join(&dht, alice()).await;
    let bob_node = join(&dht, bob()).await;
    let inbox = InfoHash::get(b"inbox:bob-live");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let token = bob_node.listen(inbox, collecting_callback(&seen), None);

    alice_node
        .put_encrypted(inbox, bob_node.id(), Value::new(USER_DATA, b"ping".to_vec()))
        .await
        .expect("put_encrypted failed");

    {
        let seen = seen.lock().expect("sink poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, b"ping");
    }

    bob_node.cancel_listen(token);
    alice_node
        .put_encrypted(inbox, bob_node.id(), Value::new(USER_DATA, b"pong".to_vec()))
        .await
        .expect("put_encrypted failed");
    assert_eq!(seen.lock().expect("sink poisoned").len(), 1);
}

#[tokio::test]
async fn plain_values_pass_through_with_user_filter() {
    let dht = shared_backend();
    let node = join(&dht, alice()).await;
    let key = InfoHash::get(b"plain");

    node.put(key, Value::with_id(USER_DATA, b"one".to_vec(), 1)).await.expect("put failed");
    node.put(key, Value::with_id(USER_DATA, b"two".to_vec(), 2)).await.expect("put failed");

    let values = node
        .get_values(key, Some(Value::id_filter(2)))
        .await
        .expect("get failed");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].data, b"two");
}

#[tokio::test]
async fn peers_resolve_each_others_certificates() {
    let dht = shared_backend();
    let alice_node = join(&dht, alice()).await;
    let bob_node = join(&dht, bob()).await;

    let resolved = alice_node
        .find_certificate(&bob_node.id())
        .await
        .expect("resolution failed");
    assert_eq!(resolved.id(), bob().certificate().id());

    // Cached now; a second resolution answers without the network.
    assert!(alice_node.cached_certificate(&bob_node.id()).is_some());
}

#[tokio::test]
async fn mismatched_identity_is_rejected_at_construction() {
    let mismatched = veilmesh::Identity::new(
        alice().private_key().clone(),
        bob().certificate().clone(),
    );
    assert!(mismatched.is_err());
}
