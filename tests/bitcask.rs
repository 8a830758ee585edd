//! End-to-end tests that drive the store through its public API: a
//! randomized operation stream checked against an in-memory model, and
//! concurrent readers racing the writer and the merger.

use std::collections::BTreeMap;
use std::thread;

use bytes::Bytes;
use bytesize::ByteSize;
use firkin::{Config, Handle, KeyValueStorage, PutOutcome};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

fn load_map(handle: &Handle) -> BTreeMap<Bytes, Bytes> {
    let mut map = BTreeMap::new();
    handle
        .traverse(|key, value| {
            map.insert(key.clone(), value.clone());
            true
        })
        .unwrap();
    map
}

fn random_string(rng: &mut StdRng, min_len: usize, max_len: usize) -> Bytes {
    let len = rng.gen_range(min_len..=max_len);
    let mut buf = vec![0u8; len];
    for byte in &mut buf {
        *byte = *b"abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ"
            .choose(rng)
            .unwrap();
    }
    Bytes::from(buf)
}

fn random_key(rng: &mut StdRng) -> Bytes {
    random_string(rng, 50, 200)
}

fn random_value(rng: &mut StdRng) -> Bytes {
    random_string(rng, 0, 400)
}

fn random_absent_key(rng: &mut StdRng, map: &BTreeMap<Bytes, Bytes>) -> Bytes {
    loop {
        let key = random_key(rng);
        if !map.contains_key(&key) {
            return key;
        }
    }
}

/// Apply a stream of random operations to the store and to an in-memory
/// model, asserting that every single operation observes the model's
/// state. Operations are drawn with the weights: hit-get 2, miss-get 0.5,
/// insert 4, update 1, hit-del 0.5, miss-del 0.1.
fn apply_random_operations(
    handle: &Handle,
    map: &mut BTreeMap<Bytes, Bytes>,
    keys: &mut Vec<Bytes>,
    count: usize,
    rng: &mut StdRng,
) {
    let operations = WeightedIndex::new([2.0, 0.5, 4.0, 1.0, 0.5, 0.1]).unwrap();
    for _ in 0..count {
        match operations.sample(rng) {
            // Get an existing key.
            0 => {
                if !keys.is_empty() {
                    let key = &keys[rng.gen_range(0..keys.len())];
                    assert_eq!(map.get(key).cloned(), handle.get(key.clone()).unwrap());
                }
            }
            // Get a key that was never written.
            1 => {
                let key = random_absent_key(rng, map);
                assert_eq!(None, handle.get(key).unwrap());
            }
            // Insert a fresh key.
            2 => {
                let key = random_absent_key(rng, map);
                let value = random_value(rng);
                assert_eq!(
                    PutOutcome::Inserted,
                    handle.put(key.clone(), value.clone()).unwrap()
                );
                map.insert(key.clone(), value);
                keys.push(key);
            }
            // Update an existing key.
            3 => {
                if !keys.is_empty() {
                    let key = keys[rng.gen_range(0..keys.len())].clone();
                    let value = random_value(rng);
                    assert_eq!(
                        PutOutcome::Updated,
                        handle.put(key.clone(), value.clone()).unwrap()
                    );
                    map.insert(key, value);
                }
            }
            // Delete an existing key.
            4 => {
                if !keys.is_empty() {
                    let key = keys.swap_remove(rng.gen_range(0..keys.len()));
                    assert!(handle.del(key.clone()).unwrap());
                    map.remove(&key);
                }
            }
            // Delete a key that was never written.
            _ => {
                let key = random_absent_key(rng, map);
                assert!(!handle.del(key).unwrap());
            }
        }
    }
}

#[test]
fn randomized_operations_match_an_in_memory_model() {
    let dir = tempfile::tempdir().unwrap();
    let conf = Config::default()
        .max_file_size(ByteSize::mib(4))
        .to_owned();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut map = BTreeMap::new();
    let mut keys = Vec::new();

    {
        let kv = conf.clone().open(dir.path()).unwrap();
        let handle = kv.get_handle();
        apply_random_operations(&handle, &mut map, &mut keys, 50_000, &mut rng);
        assert_eq!(map, load_map(&handle));

        handle.merge().unwrap();
        assert_eq!(map, load_map(&handle));
    }

    let kv = conf.open(dir.path()).unwrap();
    assert_eq!(map, load_map(&kv.get_handle()));
}

#[test]
fn concurrent_readers_observe_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let conf = Config::default()
        .max_file_size(ByteSize::kib(64))
        .to_owned();
    let kv = conf.open(dir.path()).unwrap();
    let handle = kv.get_handle();

    let mut rng = StdRng::seed_from_u64(0xca5c);
    let pairs: Vec<(Bytes, Bytes)> = (0..2000)
        .map(|i| (Bytes::from(format!("key{i}")), random_value(&mut rng)))
        .collect();
    for (key, value) in &pairs {
        handle.set(key.clone(), value.clone()).unwrap();
    }

    let concurrency = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    thread::scope(|s| {
        for worker in 0..concurrency {
            let handle = handle.clone();
            let mut pairs = pairs.clone();
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker as u64);
                pairs.shuffle(&mut rng);
                for (key, value) in pairs {
                    assert_eq!(Some(value), handle.get(key).unwrap());
                }
            });
        }
    });
}

#[test]
fn readers_and_writer_are_unaffected_by_a_concurrent_merge() {
    let dir = tempfile::tempdir().unwrap();
    let conf = Config::default()
        .max_file_size(ByteSize::kib(4))
        .to_owned();
    let kv = conf.open(dir.path()).unwrap();
    let handle = kv.get_handle();

    let old = Bytes::from(vec![b'o'; 256]);
    let new = Bytes::from(vec![b'n'; 256]);
    let keys: Vec<Bytes> = (0..500).map(|i| Bytes::from(format!("key{i:03}"))).collect();
    // Two generations of every key spread garbage over many small files.
    for _ in 0..2 {
        for key in &keys {
            handle.put(key.clone(), old.clone()).unwrap();
        }
    }

    thread::scope(|s| {
        // Readers hammer the whole key set while the merge retires the
        // files under them; every read must see one of the two values.
        for worker in 0..4 {
            let handle = handle.clone();
            let keys = keys.clone();
            let (old, new) = (old.clone(), new.clone());
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker as u64);
                for _ in 0..20 {
                    let mut keys = keys.clone();
                    keys.shuffle(&mut rng);
                    for key in keys {
                        let value = handle.get(key).unwrap().expect("key vanished");
                        assert!(value == old || value == new);
                    }
                }
            });
        }
        // The writer keeps updating concurrently with the merge.
        {
            let handle = handle.clone();
            let keys = keys.clone();
            let new = new.clone();
            s.spawn(move || {
                for key in keys {
                    handle.put(key, new.clone()).unwrap();
                }
            });
        }
        handle.merge().unwrap();
    });

    // Once the dust settles, every key holds the writer's final value.
    let expected: BTreeMap<Bytes, Bytes> =
        keys.iter().map(|k| (k.clone(), new.clone())).collect();
    assert_eq!(expected, load_map(&handle));
    handle.merge().unwrap();
    assert_eq!(expected, load_map(&handle));
}
