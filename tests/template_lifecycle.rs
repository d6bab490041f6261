use ipfix_stream::{
    BufferCollector, BufferExporter, MessageBuffer, MessageLog, Record, Session, SubTemplateList,
    Template, VARLEN, Value,
    lists::SEM_ALL_OF,
};

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn template(session: &Session, fields: &[(u16, u16)]) -> Template {
    let mut tmpl = Template::new();
    for &(num, len) in fields {
        tmpl.append(session.model().lookup(0, num).unwrap(), len)
            .unwrap();
    }
    tmpl
}

fn exported_stl_message() -> MessageLog {
    // template 256 wraps a subTemplateList of template 257 records
    let mut session = Session::default();
    let outer = template(&session, &[(292, VARLEN)]);
    session.add_external(256, outer).unwrap();
    let inner = template(&session, &[(7, 2), (1, 8)]);
    session.add_external(257, inner).unwrap();

    let log = MessageLog::new();
    let mut buf = MessageBuffer::builder()
        .with_export_time(0x1111_2222)
        .build_export(session, Box::new(BufferExporter::new(log.clone())))
        .unwrap();
    buf.export_templates().unwrap();
    buf.set_export_template(256).unwrap();

    let sub = SubTemplateList::new(
        SEM_ALL_OF,
        257,
        vec![
            Record::new(vec![Value::U16(80), Value::U64(1000)]),
            Record::new(vec![Value::U16(443), Value::U64(2000)]),
        ],
    );
    buf.append(&Record::new(vec![Value::SubTemplateList(sub)]))
        .unwrap();
    buf.emit().unwrap();
    log
}

#[test]
fn template_ctx_follows_wire_learning() {
    let log = exported_stl_message();

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    let mut reader = MessageBuffer::builder()
        .on_new_template(move |tid, tmpl| {
            seen.fetch_add(1, Ordering::SeqCst);
            Some(Box::new((tid, tmpl.len())) as Box<dyn Any>)
        })
        .build_collect(
            Session::default(),
            Box::new(BufferCollector::from_log(&log)),
        );

    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let session = reader.into_session();
    let ctx = session.template_ctx(257).unwrap();
    let (tid, fields) = ctx.downcast_ref::<(u16, usize)>().unwrap();
    assert_eq!((*tid, *fields), (257, 2));
}

#[test]
fn pair_map_picks_the_internal_layout_for_sub_lists() {
    let log = exported_stl_message();

    // the collector wants template 257's records projected onto a
    // counter-only layout installed as internal template 300
    let mut session = Session::default();
    let subset = template(&session, &[(1, 8)]);
    session.add_internal(300, subset).unwrap();
    session.set_template_pair(257, 300);

    let mut reader =
        MessageBuffer::for_collection(session, Box::new(BufferCollector::from_log(&log)));
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();

    let list = records[0].values[0].as_sub_template_list().unwrap();
    assert_eq!(list.tmpl_id, 300);
    assert_eq!(
        list.records,
        vec![
            Record::new(vec![Value::U64(1000)]),
            Record::new(vec![Value::U64(2000)]),
        ]
    );
}

#[test]
fn pair_map_zero_drops_sub_list_contents() {
    let log = exported_stl_message();

    let mut session = Session::default();
    session.set_template_pair(257, 0);
    let mut reader =
        MessageBuffer::for_collection(session, Box::new(BufferCollector::from_log(&log)));
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();

    let list = records[0].values[0].as_sub_template_list().unwrap();
    assert!(list.is_empty());
    assert_eq!(list.tmpl_id, 0);
}

#[test]
fn unknown_sub_list_template_yields_an_empty_list() {
    // announce only the outer template; 257 stays unknown to the peer
    let mut session = Session::default();
    let outer = template(&session, &[(292, VARLEN)]);
    session.add_external(256, outer).unwrap();
    let inner = template(&session, &[(7, 2)]);
    session.add_external(257, inner).unwrap();

    let log = MessageLog::new();
    let mut buf =
        MessageBuffer::for_export(session, Box::new(BufferExporter::new(log.clone()))).unwrap();
    buf.append_template(256).unwrap();
    buf.set_export_template(256).unwrap();
    let sub = SubTemplateList::new(SEM_ALL_OF, 257, vec![Record::new(vec![Value::U16(80)])]);
    buf.append(&Record::new(vec![Value::SubTemplateList(sub)]))
        .unwrap();
    buf.emit().unwrap();

    let mut reader = MessageBuffer::for_collection(
        Session::default(),
        Box::new(BufferCollector::from_log(&log)),
    );
    let records: Vec<_> = reader.records().collect::<Result<_, _>>().unwrap();
    // non-fatal: the record arrives, the list comes back empty
    assert_eq!(records.len(), 1);
    assert!(records[0].values[0].as_sub_template_list().unwrap().is_empty());
}
