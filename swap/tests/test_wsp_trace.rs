use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use swap::device::{BufferInitialize, SwapDevice};
use swap::domain::{DeviceError, Tid};
use swap::record::{Event, RecordReader, MSG_WSP, RECORD_HEADER_LEN};
use swap::wsp::{PageState, ResKind, WspEvent, WspMessage, WspTracker, WSP_MSG_LEN};

const TID: Tid = Tid(2210);
const MAIN: u64 = 0xa000_1000;
const SCRIPT: u64 = 0xa000_2000;
const IMAGE: u64 = 0xa000_3000;

/// One page: main document, a script that streams data and an image whose
/// request completes without any, then a redraw
fn load_page(tracker: &WspTracker) {
    tracker.on_will_request(TID, MAIN, ResKind::Main).expect("main request");
    tracker.on_will_request(TID, SCRIPT, ResKind::Any).expect("script request");
    tracker.on_will_request(TID, IMAGE, ResKind::Any).expect("image request");

    tracker.on_soup_request(TID, MAIN).expect("main soup");
    tracker.on_add_data(TID, MAIN).expect("main data");
    tracker.on_add_data(TID, MAIN).expect("more main data");

    tracker.on_soup_request(TID, SCRIPT).expect("script soup");
    tracker.on_add_data(TID, SCRIPT).expect("script data");
    tracker.on_finish_loading(TID, SCRIPT, ResKind::Any).expect("script done");
    tracker.on_soup_request(TID, IMAGE).expect("image soup");
    tracker.on_finish_loading(TID, IMAGE, ResKind::Any).expect("image done");
    tracker.on_finish_loading(TID, MAIN, ResKind::Main).expect("main done");

    assert!(tracker.on_redraw_begin(TID));
    assert!(tracker.on_redraw_end(TID));
}

const PAGE_EVENTS: [WspEvent; 14] = [
    WspEvent::PageLoadBegin,
    WspEvent::ResLoadBegin,
    WspEvent::ResLoadBegin,
    WspEvent::ResLoadBegin,
    WspEvent::ResProcBegin,
    WspEvent::ResProcBegin,
    WspEvent::ResProcEnd,
    WspEvent::ResLoadEnd,
    WspEvent::ResLoadEnd,
    WspEvent::ResProcEnd,
    WspEvent::ResLoadEnd,
    WspEvent::PageLoadEnd,
    WspEvent::DrawBegin,
    WspEvent::DrawEnd,
];

fn wsp_messages(stream: &[u8]) -> Vec<WspMessage> {
    RecordReader::new(stream)
        .map(|r| {
            let r = r.expect("well-framed record");
            assert_eq!(r.header.msg_id, MSG_WSP);
            match Event::decode(r.header.msg_id, &r.payload).expect("wsp payload") {
                Event::Wsp(msg) => msg,
                other => panic!("unexpected event {other:?}"),
            }
        })
        .collect()
}

#[test]
fn test_blocking_reader_receives_page_lifecycle() {
    // Six records per sub-buffer, so the page spans three of them
    let dev = SwapDevice::new();
    dev.initialize(BufferInitialize { size: 256, count: 8 }).expect("initialize pool");
    let tracker = WspTracker::new().with_sink(Arc::new(dev.writer()));

    let expected = PAGE_EVENTS.len() * (RECORD_HEADER_LEN + WSP_MSG_LEN);
    let file = dev.open(false).expect("open device");
    let (tx, rx) = bounded(1);
    let reader = thread::spawn(move || {
        let mut stream = Vec::new();
        let mut buf = [0u8; 100];
        while stream.len() < expected {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => stream.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        tx.send(stream).expect("send stream");
    });

    load_page(&tracker);
    // The last sub-buffer is only partially filled
    let pool = dev.pool().expect("pool");
    assert!(pool.flush());
    dev.wait_queue().wake_all();

    let stream = rx.recv_timeout(Duration::from_secs(5)).expect("reader finished");
    reader.join().expect("reader thread");

    let messages = wsp_messages(&stream);
    let events: Vec<WspEvent> = messages.iter().map(|m| m.event).collect();
    assert_eq!(events, PAGE_EVENTS);
    assert!(messages.iter().all(|m| m.tid == TID.0));

    // Page events carry no resource; resource events carry their object
    assert_eq!((messages[0].res_id, messages[0].ptr), (0, 0));
    assert_eq!(messages[1].ptr, MAIN);
    let main_id = messages[1].res_id;
    assert!(messages[10].res_id == main_id && messages[10].ptr == MAIN);
    assert_eq!(messages[7].ptr, SCRIPT);
    assert_eq!(messages[8].ptr, IMAGE);

    assert_eq!(tracker.page_state(TID), Some(PageState::FinishMainLoad));
    assert_eq!(tracker.resource_count(TID), 0);
    assert_eq!(pool.lost(), 0);
}

#[test]
fn test_signal_interrupts_sleeping_reader() {
    let dev = SwapDevice::new();
    dev.initialize(BufferInitialize { size: 256, count: 2 }).expect("initialize pool");
    let file = dev.open(false).expect("open device");
    let signal = file.signal_handle();

    let (tx, rx) = bounded(1);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 64];
        tx.send(file.read(&mut buf)).expect("send result");
    });

    // Keep raising until the reader has gone to sleep and noticed
    let result = loop {
        signal.raise();
        if let Ok(result) = rx.recv_timeout(Duration::from_millis(20)) {
            break result;
        }
    };
    reader.join().expect("reader thread");
    assert!(matches!(result, Err(DeviceError::Interrupted)));
}

#[test]
fn test_full_pool_counts_lost_records() {
    let dev = SwapDevice::manual();
    dev.initialize(BufferInitialize { size: 256, count: 1 }).expect("initialize pool");
    let tracker = WspTracker::new().with_sink(Arc::new(dev.writer()));

    // One sub-buffer holds six records; nobody reads
    load_page(&tracker);
    let pool = dev.pool().expect("pool");
    assert_eq!(pool.lost(), (PAGE_EVENTS.len() - 6) as u64);

    // Tracking is unaffected by lost records
    assert_eq!(tracker.page_state(TID), Some(PageState::FinishMainLoad));
}
