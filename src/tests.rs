#[cfg(test)]
mod scenario_tests {
    use crate::info_model::VARLEN;
    use crate::lists::{
        BasicList, SEM_ALL_OF, SEM_NONE_OF, SEM_UNDEFINED, SubTemplateList, SubTemplateMultiList,
        SubTemplateMultiListEntry,
    };
    use crate::transport::{BufferCollector, BufferExporter, Collector, MessageLog};
    use crate::{IpfixError, MessageBuffer, Record, Session, Template, Value};

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const EXPORT_TIME: u32 = 0x0102_0304;

    /// Session with external template `tid` over the given IANA element
    /// numbers and lengths.
    fn session_with_external(tid: u16, fields: &[(u16, u16)]) -> Session {
        let mut session = Session::default();
        add_external(&mut session, tid, fields);
        session
    }

    fn add_external(session: &mut Session, tid: u16, fields: &[(u16, u16)]) {
        let mut tmpl = Template::new();
        for &(num, len) in fields {
            tmpl.append(session.model().lookup(0, num).unwrap(), len)
                .unwrap();
        }
        session.add_external(tid, tmpl).unwrap();
    }

    fn export_buffer(session: Session) -> (MessageBuffer, MessageLog) {
        let log = MessageLog::new();
        let buf = MessageBuffer::builder()
            .with_export_time(EXPORT_TIME)
            .build_export(session, Box::new(BufferExporter::new(log.clone())))
            .unwrap();
        (buf, log)
    }

    fn collect_buffer(log: &MessageLog) -> MessageBuffer {
        MessageBuffer::for_collection(
            Session::default(),
            Box::new(BufferCollector::from_log(log)),
        )
    }

    fn drain(buf: &mut MessageBuffer) -> Vec<Record> {
        buf.records().collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn s1_hello_data_record() {
        let session = session_with_external(256, &[(1, 8)]); // octetDeltaCount
        let (mut buf, log) = export_buffer(session);

        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U64(42)])).unwrap();
        buf.emit().unwrap();

        let expected = hex::decode(concat!(
            "000a0028",         // version 10, length 40
            "01020304",         // export time
            "00000000",         // sequence
            "00000000",         // observation domain
            "0002000c",         // template set, length 12
            "0100000100010008", // tid 256, 1 field: element 1, length 8
            "0100000c",         // data set 256, length 12
            "000000000000002a", // the record
        ))
        .unwrap();
        assert_eq!(log.get(0).unwrap(), expected);
        assert_eq!(buf.session().sequence(), 1);

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        assert_eq!(records, vec![Record::new(vec![Value::U64(42)])]);
        assert_eq!(reader.session().sequence(), 1);
    }

    #[test]
    fn s2_reduced_length_round_trip() {
        // internal u64 layout, external 4-octet reduced encoding
        let mut session = session_with_external(256, &[(1, 4)]);
        let mut internal = Template::new();
        internal
            .append(session.model().lookup(0, 1).unwrap(), 8)
            .unwrap();
        session.add_internal(256, internal).unwrap();

        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.set_internal_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U64(0xFACE_F00D)])).unwrap();
        buf.emit().unwrap();

        let msg = log.get(0).unwrap();
        assert_eq!(msg.len(), 36);
        // the 4-octet field carries the low-order bytes
        assert_eq!(&msg[32..36], &[0xFA, 0xCE, 0xF0, 0x0D]);

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        assert_eq!(records[0].values[0], Value::U64(0xFACE_F00D));
    }

    #[test]
    fn s3_template_then_data_share_a_message() {
        let session = session_with_external(256, &[(10, 4)]); // ingressInterface u32
        let (mut buf, log) = export_buffer(session);

        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U32(7)])).unwrap();
        buf.emit().unwrap();

        let msg = log.get(0).unwrap();
        assert_eq!(msg.len(), 36);
        assert_eq!(u16::from_be_bytes([msg[2], msg[3]]), 36);
        // template set first, then the data set, in one message
        assert_eq!(u16::from_be_bytes([msg[16], msg[17]]), 2);
        assert_eq!(u16::from_be_bytes([msg[18], msg[19]]), 12);
        assert_eq!(u16::from_be_bytes([msg[28], msg[29]]), 256);
        assert_eq!(u16::from_be_bytes([msg[30], msg[31]]), 8);
        assert_eq!(&msg[32..36], &[0, 0, 0, 7]);
    }

    #[test]
    fn s4_unknown_template_skips_cleanly() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x000Au16.to_be_bytes());
        msg.extend_from_slice(&28u16.to_be_bytes());
        msg.extend_from_slice(&[0; 12]); // time, sequence, domain
        msg.extend_from_slice(&300u16.to_be_bytes());
        msg.extend_from_slice(&12u16.to_be_bytes());
        msg.extend_from_slice(&[0xAB; 8]);

        let mut reader = MessageBuffer::for_collection(
            Session::default(),
            Box::new(BufferCollector::new(vec![msg])),
        );
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn s5_basic_list_of_u16() {
        let session = session_with_external(256, &[(291, VARLEN)]); // basicList
        let port = session.model().lookup(0, 7).unwrap();
        let (mut buf, log) = export_buffer(session);

        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        let list = BasicList::new(
            SEM_NONE_OF,
            port,
            vec![Value::U16(1), Value::U16(2), Value::U16(3)],
        );
        buf.append(&Record::new(vec![Value::BasicList(list.clone())]))
            .unwrap();
        buf.emit().unwrap();

        let msg = log.get(0).unwrap();
        let wire_list = hex::decode("ff000b0000070002000100020003").unwrap();
        assert_eq!(&msg[32..], wire_list.as_slice());

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        let got = records[0].values[0].as_basic_list().unwrap();
        assert_eq!(got.semantic, SEM_NONE_OF);
        assert_eq!(got.values, list.values);
        assert_eq!(got.element.as_ref().unwrap().num, 7);
    }

    #[test]
    fn s6_sub_template_multi_list_entries() {
        let mut session = session_with_external(256, &[(293, VARLEN)]); // subTemplateMultiList
        add_external(&mut session, 257, &[(10, 4)]);
        add_external(&mut session, 258, &[(7, 2)]);
        let (mut buf, log) = export_buffer(session);

        buf.export_templates().unwrap();
        buf.set_export_template(256).unwrap();
        let list = SubTemplateMultiList::new(
            SEM_UNDEFINED,
            vec![
                SubTemplateMultiListEntry::new(
                    257,
                    vec![
                        Record::new(vec![Value::U32(1)]),
                        Record::new(vec![Value::U32(2)]),
                    ],
                ),
                SubTemplateMultiListEntry::new(258, Vec::new()),
            ],
        );
        buf.append(&Record::new(vec![Value::SubTemplateMultiList(list)]))
            .unwrap();
        buf.emit().unwrap();

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        let got = records[0].values[0].as_sub_template_multi_list().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got.entries[0].tmpl_id, 257);
        assert_eq!(got.entries[0].len(), 2);
        assert_eq!(got.entries[0].records[1].values[0], Value::U32(2));
        assert_eq!(got.entries[1].tmpl_id, 258);
        assert_eq!(got.entries[1].len(), 0);
    }

    fn nested_session() -> Session {
        let mut session = Session::default();
        add_external(&mut session, 256, &[(291, VARLEN)]); // basicList of subTemplateLists
        add_external(&mut session, 257, &[(291, VARLEN)]); // record layout: one basicList
        session
    }

    fn nested_record(session: &Session) -> Record {
        let stl_elem = session.model().lookup(0, 292).unwrap();
        let port = session.model().lookup(0, 7).unwrap();
        let inner = BasicList::new(SEM_NONE_OF, port, vec![Value::U16(7), Value::U16(8)]);
        let sub = SubTemplateList::new(
            SEM_UNDEFINED,
            257,
            vec![Record::new(vec![Value::BasicList(inner)])],
        );
        let outer = BasicList::new(SEM_ALL_OF, stl_elem, vec![Value::SubTemplateList(sub)]);
        Record::new(vec![Value::BasicList(outer)])
    }

    #[test]
    fn nested_list_recursion_round_trips() {
        let session = nested_session();
        let record = nested_record(&session);
        let (mut buf, log) = export_buffer(session);
        buf.export_templates().unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&record).unwrap();
        buf.emit().unwrap();
        let first_wire = log.get(0).unwrap();

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        assert_eq!(records, vec![record]);

        // byte-for-byte: re-encoding the decoded record under the same
        // templates reproduces the message
        let session = nested_session();
        let (mut buf, log) = export_buffer(session);
        buf.export_templates().unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&records[0]).unwrap();
        buf.emit().unwrap();
        assert_eq!(log.get(0).unwrap(), first_wire);
    }

    #[test]
    fn template_revocation_and_redefinition() {
        // first exporter: template 256 is a u64 counter
        let session = session_with_external(256, &[(1, 8)]);
        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U64(1)])).unwrap();
        buf.emit().unwrap();

        // second exporter: withdraw the id, redefine it as a u16 port
        let session = session_with_external(256, &[(7, 2)]);
        let (mut buf2, log2) = export_buffer(session);
        buf2.append_template_revocation(256).unwrap();
        buf2.append_template(256).unwrap();
        buf2.set_export_template(256).unwrap();
        buf2.append(&Record::new(vec![Value::U16(2)])).unwrap();
        buf2.emit().unwrap();
        log.push(log2.get(0).unwrap());

        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = accepted.clone();
        let mut reader = MessageBuffer::builder()
            .on_new_template(move |_tid, _tmpl| {
                seen.fetch_add(1, Ordering::SeqCst);
                None
            })
            .build_collect(
                Session::default(),
                Box::new(BufferCollector::from_log(&log)),
            );

        let records = drain(&mut reader);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].values[0], Value::U64(1));
        assert_eq!(records[1].values[0], Value::U16(2));
        // the callback fired once per accepted template, not for the
        // withdrawal
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        let redefined = reader.session().get_external(256).unwrap();
        assert_eq!(redefined.field(0).unwrap().element.num, 7);
    }

    #[test]
    fn sequence_continuity_across_messages() {
        let session = session_with_external(256, &[(1, 8)]);
        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();

        let counts = [3u32, 1, 4];
        for (i, &count) in counts.iter().enumerate() {
            for j in 0..count {
                buf.append(&Record::new(vec![Value::U64(u64::from(i as u32 * 10 + j))]))
                    .unwrap();
            }
            buf.emit().unwrap();
        }
        assert_eq!(buf.session().sequence(), 8);

        // each emitted header carries the pre-emit sequence
        let mut expected_seq = 0u32;
        for (i, &count) in counts.iter().enumerate() {
            let msg = log.get(i).unwrap();
            let seq = u32::from_be_bytes([msg[8], msg[9], msg[10], msg[11]]);
            assert_eq!(seq, expected_seq);
            expected_seq += count;
        }

        let mut reader = collect_buffer(&log);
        assert_eq!(drain(&mut reader).len(), 8);
        assert_eq!(reader.session().sequence(), 8);
    }

    #[test]
    fn automatic_emit_when_the_message_fills() {
        let session = session_with_external(256, &[(1, 8)]);
        let log = MessageLog::new();
        let mut buf = MessageBuffer::builder()
            .with_export_time(EXPORT_TIME)
            .build_export(session, Box::new(BufferExporter::with_mtu(log.clone(), 40)))
            .unwrap();

        buf.set_export_template(256).unwrap();
        for i in 0..3u64 {
            buf.append(&Record::new(vec![Value::U64(i)])).unwrap();
        }
        buf.emit().unwrap();

        // 40-octet MTU holds the header, one set header and two records
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(0).unwrap().len(), 36);
        assert_eq!(log.get(1).unwrap().len(), 28);
        let second = log.get(1).unwrap();
        assert_eq!(
            u32::from_be_bytes([second[8], second[9], second[10], second[11]]),
            2
        );
    }

    #[test]
    fn mtu_floor_is_enforced() {
        let session = Session::default();
        let result = MessageBuffer::builder().build_export(
            session,
            Box::new(BufferExporter::with_mtu(MessageLog::new(), 16)),
        );
        assert!(matches!(result, Err(IpfixError::BufferTooSmall { .. })));
    }

    #[test]
    fn varlen_string_round_trip() {
        let mut session = Session::default();
        let mut tmpl = Template::new();
        tmpl.append(session.model().lookup(0, 7).unwrap(), 2).unwrap();
        tmpl.append(session.model().lookup(0, 82).unwrap(), VARLEN)
            .unwrap();
        session.add_external(256, tmpl).unwrap();
        let (mut buf, log) = export_buffer(session);

        let long_name = "x".repeat(255);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![
            Value::U16(80),
            Value::Str("eth0".to_string()),
        ]))
        .unwrap();
        buf.append(&Record::new(vec![
            Value::U16(81),
            Value::Str(long_name.clone()),
        ]))
        .unwrap();
        buf.emit().unwrap();

        // the 255-octet payload must use the three-octet length form;
        // the first record occupies 7 octets after the set header at 32
        let msg = log.get(0).unwrap();
        let second_record = &msg[36 + 7..];
        assert_eq!(&second_record[..2], &81u16.to_be_bytes());
        assert_eq!(second_record[2], 0xFF);
        assert_eq!(&second_record[3..5], &[0x00, 0xFF]);

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        assert_eq!(records[0].values[1], Value::Str("eth0".to_string()));
        assert_eq!(records[1].values[1], Value::Str(long_name));
    }

    #[test]
    fn trailing_set_padding_is_skipped() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x000Au16.to_be_bytes());
        msg.extend_from_slice(&39u16.to_be_bytes());
        msg.extend_from_slice(&[0; 12]);
        // template set: tid 256 = one u32 ingressInterface
        msg.extend_from_slice(&hex::decode("0002000c01000001000a0004").unwrap());
        // data set of length 11: one record plus three padding octets
        msg.extend_from_slice(&hex::decode("0100000b00000007000000").unwrap());

        let mut reader = MessageBuffer::for_collection(
            Session::default(),
            Box::new(BufferCollector::new(vec![msg])),
        );
        let records = drain(&mut reader);
        assert_eq!(records, vec![Record::new(vec![Value::U32(7)])]);
    }

    #[test]
    fn options_template_round_trip() {
        let mut session = Session::default();
        let mut tmpl = Template::new();
        tmpl.append(session.model().lookup(0, 10).unwrap(), 4).unwrap();
        tmpl.append(session.model().lookup(0, 1).unwrap(), 8).unwrap();
        tmpl.set_scope_count(1).unwrap();
        session.add_external(400, tmpl).unwrap();
        let (mut buf, log) = export_buffer(session);

        buf.append_template(400).unwrap();
        buf.set_export_template(400).unwrap();
        buf.append(&Record::new(vec![Value::U32(9), Value::U64(100)]))
            .unwrap();
        buf.emit().unwrap();

        // templates with a scope travel in an options-template set
        let msg = log.get(0).unwrap();
        assert_eq!(u16::from_be_bytes([msg[16], msg[17]]), 3);

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        assert_eq!(
            records,
            vec![Record::new(vec![Value::U32(9), Value::U64(100)])]
        );
        let learned = reader.session().get_external(400).unwrap();
        assert_eq!(learned.scope_count(), 1);
        assert!(learned.is_options());
    }

    #[test]
    fn header_length_mismatch_needs_trust_framing() {
        let session = session_with_external(256, &[(1, 8)]);
        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U64(5)])).unwrap();
        buf.emit().unwrap();

        // a translator-style peer overstates the header length
        let mut msg = log.get(0).unwrap();
        let lie = (msg.len() + 4) as u16;
        msg[2..4].copy_from_slice(&lie.to_be_bytes());

        let mut strict = MessageBuffer::for_collection(
            Session::default(),
            Box::new(BufferCollector::new(vec![msg.clone()])),
        );
        assert!(matches!(
            strict.next_record(),
            Err(IpfixError::Protocol { .. })
        ));

        let mut lax = MessageBuffer::builder().with_trust_framing(true).build_collect(
            Session::default(),
            Box::new(BufferCollector::new(vec![msg])),
        );
        assert_eq!(
            lax.next_record().unwrap(),
            Some(Record::new(vec![Value::U64(5)]))
        );
    }

    #[test]
    fn subset_projection_zero_fills_absent_fields() {
        // internal layout: port, counter, interface; wire layout: counter only
        let mut session = session_with_external(256, &[(1, 8)]);
        let mut full = Template::new();
        for &(num, len) in &[(7u16, 2u16), (1, 8), (10, 4)] {
            full.append(session.model().lookup(0, num).unwrap(), len)
                .unwrap();
        }
        session.add_internal(256, full.clone()).unwrap();

        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.set_internal_template(256).unwrap();
        buf.append(&Record::new(vec![
            Value::U16(80),
            Value::U64(999),
            Value::U32(5),
        ]))
        .unwrap();
        buf.emit().unwrap();

        // only the counter crossed the wire
        assert_eq!(log.get(0).unwrap().len(), 40);

        let mut reader_session = Session::default();
        reader_session.add_internal(256, full).unwrap();
        let mut reader = MessageBuffer::for_collection(
            reader_session,
            Box::new(BufferCollector::from_log(&log)),
        );
        reader.set_internal_template(256).unwrap();
        let records = drain(&mut reader);
        assert_eq!(
            records,
            vec![Record::new(vec![
                Value::U16(0),
                Value::U64(999),
                Value::U32(0),
            ])]
        );
    }

    #[test]
    fn decoded_record_serializes_to_json() {
        let session = session_with_external(256, &[(1, 8)]);
        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U64(42)])).unwrap();
        buf.emit().unwrap();

        let mut reader = collect_buffer(&log);
        let records = drain(&mut reader);
        assert_eq!(
            serde_json::to_value(&records[0]).unwrap(),
            serde_json::json!({ "values": [{ "U64": 42 }] })
        );
    }

    struct WakeableCollector {
        interrupted: std::rc::Rc<std::cell::Cell<bool>>,
    }

    impl Collector for WakeableCollector {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, IpfixError> {
            if self.interrupted.get() {
                Err(IpfixError::Interrupted)
            } else {
                Ok(0)
            }
        }

        fn interrupt(&self) {
            self.interrupted.set(true);
        }
    }

    #[test]
    fn interrupt_surfaces_on_read() {
        let flag = std::rc::Rc::new(std::cell::Cell::new(false));
        let mut reader = MessageBuffer::for_collection(
            Session::default(),
            Box::new(WakeableCollector {
                interrupted: flag.clone(),
            }),
        );
        reader.interrupt();
        assert!(flag.get());
        assert!(matches!(reader.next_record(), Err(IpfixError::Interrupted)));
    }

    #[test]
    fn alien_elements_are_learned_from_the_wire() {
        // hand-built template referencing enterprise element 6871/999
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x000Au16.to_be_bytes());
        msg.extend_from_slice(&42u16.to_be_bytes());
        msg.extend_from_slice(&[0; 12]);
        // template set: tid 256, 1 field, enterprise bit set
        msg.extend_from_slice(&2u16.to_be_bytes());
        msg.extend_from_slice(&16u16.to_be_bytes());
        msg.extend_from_slice(&256u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&(999u16 | 0x8000).to_be_bytes());
        msg.extend_from_slice(&6u16.to_be_bytes());
        msg.extend_from_slice(&6871u32.to_be_bytes());
        // data set: one 6-octet record
        msg.extend_from_slice(&256u16.to_be_bytes());
        msg.extend_from_slice(&10u16.to_be_bytes());
        msg.extend_from_slice(&[1, 2, 3, 4, 5, 6]);

        let mut reader = MessageBuffer::for_collection(
            Session::default(),
            Box::new(BufferCollector::new(vec![msg])),
        );
        let records = drain(&mut reader);
        assert_eq!(
            records,
            vec![Record::new(vec![Value::Octets(vec![1, 2, 3, 4, 5, 6])])]
        );
        let alien = reader.session().model().lookup(6871, 999).unwrap();
        assert_eq!(alien.len, 6);
        assert!(!alien.is_endian());
    }

    #[test]
    fn into_session_returns_learned_state() {
        let session = session_with_external(256, &[(1, 8)]);
        let (mut buf, log) = export_buffer(session);
        buf.append_template(256).unwrap();
        buf.set_export_template(256).unwrap();
        buf.append(&Record::new(vec![Value::U64(3)])).unwrap();
        buf.emit().unwrap();

        let mut reader = collect_buffer(&log);
        drain(&mut reader);
        let session = reader.into_session();
        assert!(session.get_external(256).is_some());
        assert_eq!(session.sequence(), 1);
    }
}
