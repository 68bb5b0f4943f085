//! Property checks for the record codec and the in-memory queue.

use proptest::collection;
use proptest::prelude::*;

use safequeue::codec::{self, MAX_DEPTH};
use safequeue::{CodecError, Key, QueueError, Record, SafeQueue, Terminator, Value};

const SLOT: usize = 4096;

fn key() -> impl Strategy<Value = Key> {
    prop_oneof![
        "[a-z_]{0,12}".prop_map(Key::from),
        (-1.0e9f64..1.0e9).prop_map(Key::Number),
        (0i32..64).prop_map(Key::from),
    ]
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Nil),
        any::<bool>().prop_map(Value::Bool),
        (-1.0e12f64..1.0e12).prop_map(Value::Number),
        collection::vec(any::<u8>(), 0..48).prop_map(Value::String),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 48, 6, |inner| {
        collection::vec((key(), inner), 0..6)
            .prop_map(|entries| Value::Record(entries.into_iter().collect()))
    })
}

fn record() -> impl Strategy<Value = Record> {
    collection::vec((key(), value()), 0..8).prop_map(|entries| entries.into_iter().collect())
}

fn nested(depth: usize) -> Record {
    let mut record = Record::new().with("leaf", true);
    for _ in 0..depth {
        record = Record::new().with("r", record);
    }
    record
}

proptest! {
    /// Whatever fits in a slot decodes back to an equal record; whatever
    /// does not is rejected as an overflow, never truncated.
    #[test]
    fn record_survives_encoding(record in record(), explicit in any::<bool>()) {
        let terminator = if explicit { Terminator::Explicit } else { Terminator::Implicit };
        let mut slot = vec![0xAAu8; SLOT];
        match codec::encode_into(&record, &mut slot, terminator) {
            Ok(len) => {
                prop_assert!(len <= SLOT);
                prop_assert!(slot[len..].iter().all(|b| *b == 0));
                prop_assert_eq!(codec::decode(&slot).expect("decode"), record);
            }
            Err(e) => prop_assert!(matches!(e, CodecError::Overflow { .. }), "unexpected {:?}", e),
        }
    }

    /// Records pushed through a small ring in random batches come out in push order.
    #[test]
    fn queue_preserves_push_order(
        records in collection::vec(record(), 1..40),
        batch in 1usize..8,
    ) {
        let mut queue = SafeQueue::in_memory(8, SLOT).expect("queue");
        let mut expected = std::collections::VecDeque::new();
        for chunk in records.chunks(batch) {
            for record in chunk {
                match queue.try_push(record) {
                    Ok(()) => expected.push_back(record.clone()),
                    Err(QueueError::Full { .. }) => {}
                    Err(QueueError::Codec(CodecError::Overflow { .. })) => {}
                    Err(e) => prop_assert!(false, "unexpected push error {:?}", e),
                }
            }
            while let Some(got) = queue.try_pop().expect("pop") {
                prop_assert_eq!(Some(got), expected.pop_front());
            }
        }
        prop_assert!(expected.is_empty());
    }
}

#[test]
fn depth_limit_is_inclusive() {
    let at_limit = nested(MAX_DEPTH);
    let bytes = codec::encode(&at_limit, 1 << 16, Terminator::Explicit).expect("at limit");
    assert_eq!(codec::decode(&bytes).expect("decode"), at_limit);

    assert_eq!(
        codec::encode(&nested(MAX_DEPTH + 1), 1 << 16, Terminator::Explicit),
        Err(CodecError::TooDeep { limit: MAX_DEPTH })
    );
}
