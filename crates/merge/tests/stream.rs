//! Transport-shaped integration: framed envelopes and concurrent delivery.

use common::{Column, MergeKey, SourceId};
use merge::{MergeIndex, RowCursor, TableIndex};
use pretty_assertions::assert_eq;
use protocol::{frame, PageEnvelope};
use std::io::Cursor as IoCursor;
use testsupport::{data_page, drain_cursor, envelope, int_rows};
use types::{SqlType, Value};

#[test]
fn framed_envelopes_feed_the_index() {
    let index = MergeIndex::builder()
        .label("wire_scan")
        .columns(vec![Column::new("v", SqlType::Int)])
        .build();
    let s1 = SourceId::random();
    let s2 = SourceId::random();
    index.register_source(s1).unwrap();
    index.register_source(s2).unwrap();

    // what the map nodes put on the wire
    let outbound = vec![
        PageEnvelope::data(s1, int_rows(&[1, 2]), Some(3)),
        PageEnvelope::data(s1, int_rows(&[3]), None),
        PageEnvelope::data(s2, int_rows(&[4]), Some(1)),
    ];

    let mut wire = Vec::new();
    for env in &outbound {
        frame::write_message(&mut wire, env).unwrap();
    }

    // what the reducer-side transport does with the bytes
    let mut reader = IoCursor::new(wire);
    for _ in 0..outbound.len() {
        let env: PageEnvelope = frame::read_message(&mut reader).unwrap();
        index.add_page(envelope::to_page(env)).unwrap();
    }

    assert_eq!(index.row_count(), 4);
    let mut cursor = index.find(None, None).unwrap();
    assert_eq!(drain_cursor(cursor.as_mut()).unwrap(), int_rows(&[1, 2, 3, 4]));
}

#[test]
fn fail_envelope_poisons_the_stream() {
    let index = MergeIndex::builder()
        .label("wire_scan")
        .columns(vec![Column::new("v", SqlType::Int)])
        .build();
    let s = SourceId::random();
    index.register_source(s).unwrap();

    index
        .add_page(envelope::to_page(PageEnvelope::data(s, int_rows(&[1]), Some(2))))
        .unwrap();
    index
        .add_page(envelope::to_page(PageEnvelope::fail(s, "map node crashed")))
        .unwrap();

    let mut cursor = index.find(None, None).unwrap();
    assert_eq!(cursor.next().unwrap(), Some(testsupport::int_row(1)));
    let error = cursor.next().unwrap_err();
    assert_eq!(error.to_string(), "source failure: map node crashed");
}

#[test]
fn concurrent_transports_deliver_every_row_exactly_once() {
    use std::thread;

    let index = MergeIndex::builder()
        .label("reduce_scan")
        .columns(vec![Column::new("v", SqlType::Int)])
        .build();

    let sources: Vec<SourceId> = (0..4).map(|_| SourceId::random()).collect();
    for &s in &sources {
        index.register_source(s).unwrap();
    }

    // source i contributes values i*100 .. i*100+30; first pages arrive
    // before the executor opens its cursor, as the reduce phase guarantees
    for (i, &s) in sources.iter().enumerate() {
        let base = (i as i64) * 100;
        let vals: Vec<i64> = (base..base + 10).collect();
        index.add_page(data_page(s, &vals, Some(30))).unwrap();
    }

    thread::scope(|scope| {
        for (i, &s) in sources.iter().enumerate() {
            let index = &index;
            scope.spawn(move || {
                let base = (i as i64) * 100;
                let vals: Vec<i64> = (base..base + 30).collect();
                index.add_page(data_page(s, &vals[10..20], None)).unwrap();
                index.add_page(data_page(s, &vals[20..30], None)).unwrap();
            });
        }

        // drain concurrently with delivery; the cursor blocks as needed
        let mut cursor = index.find(None, None).unwrap();
        let mut got: Vec<i64> = drain_cursor(cursor.as_mut())
            .unwrap()
            .into_iter()
            .map(|row| match &row.values[0] {
                Value::Int(v) => *v,
                _ => panic!("unexpected value type"),
            })
            .collect();
        got.sort_unstable();

        let mut want: Vec<i64> = (0..4)
            .flat_map(|i| (i * 100..i * 100 + 30))
            .collect();
        want.sort_unstable();
        assert_eq!(got, want);
    });

    assert_eq!(index.row_count(), 120);
    assert_eq!(index.fetched_rows(), 120);
}

#[test]
fn sorted_merge_holds_under_concurrent_delivery() {
    use std::thread;
    use std::time::Duration;

    let index = MergeIndex::builder()
        .label("ordered_reduce")
        .columns(vec![Column::new("v", SqlType::Int)])
        .keys(vec![MergeKey::asc(0)])
        .build();

    let sources: Vec<SourceId> = (0..3).map(|_| SourceId::random()).collect();
    for &s in &sources {
        index.register_source(s).unwrap();
    }

    // each source streams an already-sorted run, split across pages; the
    // first page of each run lands before the cursor opens
    for (i, &s) in sources.iter().enumerate() {
        let vals: Vec<i64> = (0..7).map(|k| k * 3 + i as i64).collect();
        index.add_page(data_page(s, &vals, Some(20))).unwrap();
    }

    thread::scope(|scope| {
        for (i, &s) in sources.iter().enumerate() {
            let index = &index;
            scope.spawn(move || {
                let vals: Vec<i64> = (0..20).map(|k| k * 3 + i as i64).collect();
                thread::sleep(Duration::from_millis(10));
                index.add_page(data_page(s, &vals[7..15], None)).unwrap();
                thread::sleep(Duration::from_millis(10));
                index.add_page(data_page(s, &vals[15..20], None)).unwrap();
            });
        }

        let mut cursor = index.find(None, None).unwrap();
        let got: Vec<i64> = drain_cursor(cursor.as_mut())
            .unwrap()
            .into_iter()
            .map(|row| match &row.values[0] {
                Value::Int(v) => *v,
                _ => panic!("unexpected value type"),
            })
            .collect();

        // globally sorted and complete
        let want: Vec<i64> = (0..60).collect();
        assert_eq!(got, want);
    });
}
