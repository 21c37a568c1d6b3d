//! Per-thread web resource tracking
//!
//! Each monitored thread gets its own [`ThreadData`] behind its own mutex,
//! so two threads loading pages at once never share a resource list. Ids
//! come from one counter shared by every thread.

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::msg::{WspEvent, WspMessage};
use super::res::{PageState, ResKind, ResState, WspResource};
use crate::domain::{Tid, WspError};
use crate::record::{RecordSink, MSG_WSP};

/// Tracking context of one thread
#[derive(Debug)]
pub struct ThreadData {
    pub page: PageState,
    resources: VecDeque<WspResource>,
}

impl Default for ThreadData {
    fn default() -> Self {
        Self { page: PageState::New, resources: VecDeque::new() }
    }
}

impl ThreadData {
    /// Newest first; resources in `Err` are never returned
    fn find_mut(&mut self, ptr: u64, kind: ResKind) -> Option<&mut WspResource> {
        self.resources.iter_mut().find(|r| r.ptr == ptr && r.kind.matches(kind) && !r.is_err())
    }

    fn position(&self, ptr: u64, kind: ResKind) -> Option<usize> {
        self.resources.iter().position(|r| r.ptr == ptr && r.kind.matches(kind) && !r.is_err())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

pub struct WspTracker {
    threads: RwLock<HashMap<Tid, Arc<Mutex<ThreadData>>>>,
    next_id: AtomicU32,
    sink: Option<Arc<dyn RecordSink>>,
}

impl Default for WspTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WspTracker {
    #[must_use]
    pub fn new() -> Self {
        Self { threads: RwLock::new(HashMap::new()), next_id: AtomicU32::new(1), sink: None }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn lookup(&self, tid: Tid) -> Option<Arc<Mutex<ThreadData>>> {
        self.threads.read().get(&tid).cloned()
    }

    /// Context of `tid`, created on first use
    fn context(&self, tid: Tid) -> Arc<Mutex<ThreadData>> {
        if let Some(data) = self.threads.read().get(&tid) {
            return Arc::clone(data);
        }
        Arc::clone(self.threads.write().entry(tid).or_default())
    }

    fn emit(&self, msg: WspMessage) {
        debug!("{:?} {} res {} ({:#x})", msg.event, Tid(msg.tid), msg.res_id, msg.ptr);
        if let Some(sink) = &self.sink {
            sink.emit(MSG_WSP, &msg.encode());
        }
    }

    fn emit_res(&self, event: WspEvent, tid: Tid, res: &WspResource) {
        self.emit(WspMessage { event, tid: tid.0, res_id: res.id, ptr: res.ptr });
    }

    /// Start tracking `ptr` on `tid`; returns the new resource id
    ///
    /// Resources that failed since the last call are dropped first.
    pub fn new_resource(&self, tid: Tid, ptr: u64, kind: ResKind) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let data = self.context(tid);
        let mut data = data.lock();
        data.resources.retain(|r| !r.is_err());
        data.resources.push_front(WspResource::new(ptr, id, kind));
        id
    }

    /// Live resource for `(ptr, kind)`
    ///
    /// # Errors
    /// [`WspError::NotFound`] if there is none or it has failed
    pub fn find_resource(&self, tid: Tid, ptr: u64, kind: ResKind) -> Result<WspResource, WspError> {
        let data = self.lookup(tid).ok_or(WspError::NotFound { ptr })?;
        let mut data = data.lock();
        data.find_mut(ptr, kind).cloned().ok_or(WspError::NotFound { ptr })
    }

    /// Advance a live resource; returns the state it left
    ///
    /// # Errors
    /// - [`WspError::NotFound`] as for [`WspTracker::find_resource`]
    /// - [`WspError::IllegalTransition`]; the resource is failed afterwards
    pub fn advance_resource(
        &self,
        tid: Tid,
        ptr: u64,
        kind: ResKind,
        next: ResState,
    ) -> Result<ResState, WspError> {
        let data = self.lookup(tid).ok_or(WspError::NotFound { ptr })?;
        let mut data = data.lock();
        let res = data.find_mut(ptr, kind).ok_or(WspError::NotFound { ptr })?;
        let from = res.state();
        res.advance(next)?;
        Ok(from)
    }

    /// Report the end of a resource load and forget the resource
    ///
    /// # Errors
    /// [`WspError::NotFound`] if there is no live resource for `(ptr, kind)`
    pub fn finish_resource(&self, tid: Tid, ptr: u64, kind: ResKind) -> Result<(), WspError> {
        let data = self.lookup(tid).ok_or(WspError::NotFound { ptr })?;
        let res = {
            let mut data = data.lock();
            let at = data.position(ptr, kind).ok_or(WspError::NotFound { ptr })?;
            data.resources.remove(at).ok_or(WspError::NotFound { ptr })?
        };
        self.emit_res(WspEvent::ResLoadEnd, tid, &res);
        Ok(())
    }

    /// `willSendRequest`: a new load begins
    ///
    /// # Errors
    /// Never in practice; a fresh resource always accepts `WillReq`
    pub fn on_will_request(&self, tid: Tid, ptr: u64, kind: ResKind) -> Result<u32, WspError> {
        if kind == ResKind::Main {
            self.context(tid).lock().page = PageState::New;
            self.emit(WspMessage::page(WspEvent::PageLoadBegin, tid.0));
        }
        let id = self.new_resource(tid, ptr, kind);
        self.advance_resource(tid, ptr, kind, ResState::WillReq)?;
        self.emit(WspMessage { event: WspEvent::ResLoadBegin, tid: tid.0, res_id: id, ptr });
        Ok(id)
    }

    /// The request went out to the network layer
    ///
    /// # Errors
    /// See [`WspTracker::advance_resource`]
    pub fn on_soup_request(&self, tid: Tid, ptr: u64) -> Result<(), WspError> {
        self.advance_resource(tid, ptr, ResKind::Any, ResState::SoupReq).map(|_| ())
    }

    /// A data chunk arrived; the first one starts processing
    ///
    /// # Errors
    /// See [`WspTracker::advance_resource`]
    pub fn on_add_data(&self, tid: Tid, ptr: u64) -> Result<(), WspError> {
        let from = self.advance_resource(tid, ptr, ResKind::Any, ResState::AddData)?;
        if from == ResState::SoupReq {
            let res = self.find_resource(tid, ptr, ResKind::Any)?;
            self.emit_res(WspEvent::ResProcBegin, tid, &res);
        }
        Ok(())
    }

    /// The load completed; a finished main resource ends the page load
    ///
    /// # Errors
    /// See [`WspTracker::advance_resource`]
    pub fn on_finish_loading(&self, tid: Tid, ptr: u64, kind: ResKind) -> Result<(), WspError> {
        let res = self.find_resource(tid, ptr, kind)?;
        let from = self.advance_resource(tid, ptr, kind, ResState::Finish)?;
        if from == ResState::AddData {
            self.emit_res(WspEvent::ResProcEnd, tid, &res);
        }

        // The context exists: the resource was just found in it
        let data = self.lookup(tid).ok_or(WspError::NotFound { ptr })?;
        {
            // A finished resource is the newest live match for the key
            let mut data = data.lock();
            if let Some(at) = data.resources.iter().position(|r| r.id == res.id) {
                data.resources.remove(at);
            }
        }
        self.emit_res(WspEvent::ResLoadEnd, tid, &res);

        if res.kind == ResKind::Main {
            data.lock().page = PageState::FinishMainLoad;
            self.emit(WspMessage::page(WspEvent::PageLoadEnd, tid.0));
        }
        Ok(())
    }

    /// Returns `true` if a draw of a loaded page began
    pub fn on_redraw_begin(&self, tid: Tid) -> bool {
        let Some(data) = self.lookup(tid) else {
            return false;
        };
        {
            let mut data = data.lock();
            if data.page != PageState::FinishMainLoad {
                return false;
            }
            data.page = PageState::Draw;
        }
        self.emit(WspMessage::page(WspEvent::DrawBegin, tid.0));
        true
    }

    /// Returns `true` if a draw ended
    pub fn on_redraw_end(&self, tid: Tid) -> bool {
        let Some(data) = self.lookup(tid) else {
            return false;
        };
        {
            let mut data = data.lock();
            if data.page != PageState::Draw {
                return false;
            }
            data.page = PageState::FinishMainLoad;
        }
        self.emit(WspMessage::page(WspEvent::DrawEnd, tid.0));
        true
    }

    #[must_use]
    pub fn page_state(&self, tid: Tid) -> Option<PageState> {
        self.lookup(tid).map(|data| data.lock().page)
    }

    /// Resources tracked for `tid`, failed ones included
    #[must_use]
    pub fn resource_count(&self, tid: Tid) -> usize {
        self.lookup(tid).map_or(0, |data| data.lock().len())
    }

    /// Threads with a tracking context
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Drop the context of an exited thread
    pub fn remove_thread(&self, tid: Tid) -> bool {
        let Some(data) = self.threads.write().remove(&tid) else {
            return false;
        };
        let left = data.lock().len();
        if left > 0 {
            warn!("{tid} exited with {left} resources still loading");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordLog;

    const TID: Tid = Tid(2001);
    const PAGE: u64 = 0x0a10_2000;
    const IMG: u64 = 0x0a10_3400;

    fn tracker() -> (Arc<RecordLog>, WspTracker) {
        let log = Arc::new(RecordLog::new());
        let tracker = WspTracker::new().with_sink(log.clone());
        (log, tracker)
    }

    fn events(log: &RecordLog) -> Vec<(WspEvent, u32)> {
        log.drain()
            .into_iter()
            .map(|(id, payload)| {
                assert_eq!(id, MSG_WSP);
                let msg = WspMessage::decode(&payload).unwrap();
                (msg.event, msg.res_id)
            })
            .collect()
    }

    #[test]
    fn test_page_load_sequence() {
        let (log, tracker) = tracker();
        let main = tracker.on_will_request(TID, PAGE, ResKind::Main).unwrap();
        tracker.on_soup_request(TID, PAGE).unwrap();
        tracker.on_add_data(TID, PAGE).unwrap();
        tracker.on_add_data(TID, PAGE).unwrap();

        let img = tracker.on_will_request(TID, IMG, ResKind::Any).unwrap();
        tracker.on_soup_request(TID, IMG).unwrap();
        tracker.on_finish_loading(TID, IMG, ResKind::Any).unwrap();

        tracker.on_finish_loading(TID, PAGE, ResKind::Main).unwrap();
        assert_eq!(tracker.page_state(TID), Some(PageState::FinishMainLoad));
        assert!(tracker.on_redraw_begin(TID));
        assert!(tracker.on_redraw_end(TID));

        assert_eq!(
            events(&log),
            vec![
                (WspEvent::PageLoadBegin, 0),
                (WspEvent::ResLoadBegin, main),
                (WspEvent::ResProcBegin, main),
                (WspEvent::ResLoadBegin, img),
                (WspEvent::ResLoadEnd, img),
                (WspEvent::ResProcEnd, main),
                (WspEvent::ResLoadEnd, main),
                (WspEvent::PageLoadEnd, 0),
                (WspEvent::DrawBegin, 0),
                (WspEvent::DrawEnd, 0),
            ]
        );
        assert_eq!(tracker.resource_count(TID), 0);
    }

    #[test]
    fn test_finish_from_new_fails_resource() {
        let (log, tracker) = tracker();
        tracker.new_resource(TID, IMG, ResKind::Any);

        let err = tracker.advance_resource(TID, IMG, ResKind::Any, ResState::Finish).unwrap_err();
        assert!(matches!(err, WspError::IllegalTransition { .. }));
        assert!(matches!(
            tracker.find_resource(TID, IMG, ResKind::Any),
            Err(WspError::NotFound { ptr: IMG })
        ));
        assert!(tracker.finish_resource(TID, IMG, ResKind::Any).is_err());
        assert!(log.is_empty());
    }

    #[test]
    fn test_skipped_request_is_rejected() {
        let (_log, tracker) = tracker();
        tracker.on_will_request(TID, IMG, ResKind::Any).unwrap();
        assert!(tracker.on_add_data(TID, IMG).is_err());
        assert!(tracker.on_soup_request(TID, IMG).is_err());
    }

    #[test]
    fn test_threads_are_isolated() {
        let (_log, tracker) = tracker();
        let other = Tid(2002);
        tracker.on_will_request(TID, PAGE, ResKind::Main).unwrap();
        tracker.on_will_request(other, PAGE, ResKind::Main).unwrap();

        tracker.on_soup_request(TID, PAGE).unwrap();
        // Same pointer on another thread is still at WillReq
        assert_eq!(
            tracker.find_resource(other, PAGE, ResKind::Main).unwrap().state(),
            ResState::WillReq
        );
        assert!(tracker.on_finish_loading(other, PAGE, ResKind::Main).is_err());
        assert_eq!(tracker.find_resource(TID, PAGE, ResKind::Any).unwrap().state(), ResState::SoupReq);
    }

    #[test]
    fn test_main_lookup_ignores_subresources() {
        let (_log, tracker) = tracker();
        tracker.new_resource(TID, IMG, ResKind::Any);
        assert!(tracker.find_resource(TID, IMG, ResKind::Main).is_err());
        assert!(tracker.find_resource(TID, IMG, ResKind::Any).is_ok());
    }

    #[test]
    fn test_redraw_needs_loaded_page() {
        let (log, tracker) = tracker();
        assert!(!tracker.on_redraw_begin(TID));
        assert!(!tracker.on_redraw_end(TID));
        assert!(log.is_empty());
    }

    #[test]
    fn test_failed_resources_do_not_pile_up() {
        let (_log, tracker) = tracker();
        for i in 0..100u64 {
            let ptr = IMG + i * 0x40;
            tracker.on_will_request(TID, ptr, ResKind::Any).unwrap();
            assert!(tracker.on_add_data(TID, ptr).is_err());
            assert!(tracker.find_resource(TID, ptr, ResKind::Any).is_err());
        }
        // Only the last failure is still held
        assert_eq!(tracker.resource_count(TID), 1);
    }

    #[test]
    fn test_lookups_on_unknown_thread_create_nothing() {
        let (log, tracker) = tracker();
        let stranger = Tid(9);
        assert!(tracker.find_resource(stranger, PAGE, ResKind::Any).is_err());
        assert!(tracker.on_soup_request(stranger, PAGE).is_err());
        assert!(tracker.on_add_data(stranger, PAGE).is_err());
        assert!(tracker.on_finish_loading(stranger, PAGE, ResKind::Main).is_err());
        assert!(tracker.finish_resource(stranger, PAGE, ResKind::Any).is_err());
        assert!(!tracker.on_redraw_begin(stranger));
        assert_eq!(tracker.page_state(stranger), None);
        assert_eq!(tracker.thread_count(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_ids_are_global() {
        let (_log, tracker) = tracker();
        let a = tracker.new_resource(TID, PAGE, ResKind::Any);
        let b = tracker.new_resource(Tid(7), PAGE, ResKind::Any);
        assert_eq!((a, b), (1, 2));
        assert!(tracker.remove_thread(Tid(7)));
        assert!(!tracker.remove_thread(Tid(7)));
    }
}
