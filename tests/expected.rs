//! Expected (tag-matched) messaging: per-peer matching, early arrivals,
//! FIFO-within-tag ordering, truncation, and cancellation.

mod support;

use std::sync::Arc;

use fabric_rpc::net::loopback::{LoopbackFabric, LoopbackTransport};
use fabric_rpc::net::{Endpoint, OpKind, Transport};
use fabric_rpc::Error;

use support::{assert_idle, capture, drive, lookup};

struct Pair {
    fabric: LoopbackFabric,
    a: Arc<Endpoint>,
    b: Arc<Endpoint>,
    ta: Arc<LoopbackTransport>,
    tb: Arc<LoopbackTransport>,
}

fn pair() -> Pair {
    let fabric = LoopbackFabric::new();
    let ta = fabric.open("a").expect("open a");
    let tb = fabric.open("b").expect("open b");
    let a = Arc::new(Endpoint::new(Arc::clone(&ta) as Arc<dyn Transport>));
    let b = Arc::new(Endpoint::new(Arc::clone(&tb) as Arc<dyn Transport>));
    Pair { fabric, a, b, ta, tb }
}

#[test]
fn posted_receive_matches_matching_send() {
    let pair = pair();
    let b_addr = lookup(&pair.a, "loop://b");
    let a_addr = lookup(&pair.b, "loop://a");

    let (recv_cb, recv_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 5, vec![0_u8; 16], recv_cb)
        .expect("post receive");

    let (send_cb, send_rx) = capture();
    pair.a
        .msg_send_expected(&b_addr, 5, vec![1, 2, 3, 4], send_cb)
        .expect("post send");

    drive(&pair.a); // send completion
    drive(&pair.b); // arrival matches the post

    let send_done = send_rx.try_recv().expect("send completed");
    assert_eq!(send_done.kind, OpKind::SendExpected);
    assert_eq!(send_done.result, Ok(()));
    assert_eq!(send_done.buffer.as_deref(), Some(&[1, 2, 3, 4][..]));

    let recv_done = recv_rx.try_recv().expect("receive completed");
    assert_eq!(recv_done.kind, OpKind::RecvExpected);
    assert_eq!(recv_done.result, Ok(()));
    assert_eq!(recv_done.actual_size, 4);
    assert_eq!(recv_done.tag, 5);
    let buf = recv_done.buffer.expect("buffer handed back");
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert_eq!(recv_done.source.expect("source").uri(), "loop://a");

    // Exactly one completion each.
    assert!(recv_rx.try_recv().is_err());
    assert!(send_rx.try_recv().is_err());

    // Every dequeued event went back to the transport.
    assert_eq!(pair.ta.outstanding_events(), 0);
    assert_eq!(pair.tb.outstanding_events(), 0);
}

#[test]
fn early_arrival_completes_the_post_synchronously() {
    let pair = pair();
    let b_addr = lookup(&pair.a, "loop://b");
    let a_addr = lookup(&pair.b, "loop://a");

    let (send_cb, _send_rx) = capture();
    pair.a
        .msg_send_expected(&b_addr, 7, vec![9, 8, 7, 6], send_cb)
        .expect("post send");
    drive(&pair.a);
    drive(&pair.b); // no post yet: cached as an early arrival

    let (recv_cb, recv_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 7, vec![0_u8; 16], recv_cb)
        .expect("post receive");

    // No progress call in between: the match happened from the posting
    // context.
    let recv_done = recv_rx.try_recv().expect("synchronous completion");
    assert_eq!(recv_done.actual_size, 4);
    assert_eq!(&recv_done.buffer.expect("buffer")[..4], &[9, 8, 7, 6]);

    // The early entry was consumed: a second post under the same tag finds
    // nothing and just queues.
    let (recv_cb, recv_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 7, vec![0_u8; 16], recv_cb)
        .expect("post receive");
    assert!(recv_rx.try_recv().is_err());
    assert_idle(&pair.b);
}

#[test]
fn matching_is_fifo_within_a_tag() {
    let pair = pair();
    let b_addr = lookup(&pair.a, "loop://b");
    let a_addr = lookup(&pair.b, "loop://a");

    let (first_cb, first_rx) = capture();
    let (second_cb, second_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 4, vec![0_u8; 8], first_cb)
        .expect("post first");
    pair.b
        .msg_recv_expected(&a_addr, 4, vec![0_u8; 8], second_cb)
        .expect("post second");

    let (send_cb, _rx) = capture();
    pair.a.msg_send_expected(&b_addr, 4, vec![1], send_cb).expect("send one");
    let (send_cb, _rx2) = capture();
    pair.a.msg_send_expected(&b_addr, 4, vec![2], send_cb).expect("send two");

    drive(&pair.a);
    drive(&pair.a);
    drive(&pair.b);
    drive(&pair.b);

    let first = first_rx.try_recv().expect("first post completed");
    let second = second_rx.try_recv().expect("second post completed");
    assert_eq!(first.buffer.expect("buffer")[0], 1);
    assert_eq!(second.buffer.expect("buffer")[0], 2);
}

#[test]
fn tags_never_cross() {
    let pair = pair();
    let b_addr = lookup(&pair.a, "loop://b");
    let a_addr = lookup(&pair.b, "loop://a");

    let (recv_cb, recv_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 2, vec![0_u8; 8], recv_cb)
        .expect("post for tag 2");

    let (send_cb, _rx) = capture();
    pair.a.msg_send_expected(&b_addr, 1, vec![0xAA], send_cb).expect("send tag 1");
    let (send_cb, _rx2) = capture();
    pair.a.msg_send_expected(&b_addr, 2, vec![0xBB], send_cb).expect("send tag 2");

    drive(&pair.a);
    drive(&pair.a);
    drive(&pair.b); // tag 1 arrives first but must not match the tag-2 post
    drive(&pair.b);

    let done = recv_rx.try_recv().expect("tag 2 completion");
    assert_eq!(done.tag, 2);
    assert_eq!(done.buffer.expect("buffer")[0], 0xBB);

    // The tag-1 message was cached early and a matching post consumes it
    // synchronously.
    let (recv_cb, recv_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 1, vec![0_u8; 8], recv_cb)
        .expect("post for tag 1");
    let done = recv_rx.try_recv().expect("early match");
    assert_eq!(done.tag, 1);
    assert_eq!(done.buffer.expect("buffer")[0], 0xAA);
}

#[test]
fn receive_truncates_to_capacity() {
    let pair = pair();
    let b_addr = lookup(&pair.a, "loop://b");
    let a_addr = lookup(&pair.b, "loop://a");

    let (recv_cb, recv_rx) = capture();
    pair.b
        .msg_recv_expected(&a_addr, 3, vec![0_u8; 2], recv_cb)
        .expect("post receive");
    let (send_cb, _rx) = capture();
    pair.a
        .msg_send_expected(&b_addr, 3, vec![1, 2, 3, 4], send_cb)
        .expect("post send");

    drive(&pair.a);
    drive(&pair.b);

    let done = recv_rx.try_recv().expect("completion");
    assert_eq!(done.actual_size, 2);
    assert_eq!(done.buffer.expect("buffer"), vec![1, 2]);
}

#[test]
fn self_address_loops_back() {
    let pair = pair();
    let self_addr = pair.a.addr_self();
    assert!(self_addr.is_self());

    let (recv_cb, recv_rx) = capture();
    pair.a
        .msg_recv_expected(&self_addr, 11, vec![0_u8; 8], recv_cb)
        .expect("post receive");
    let (send_cb, send_rx) = capture();
    pair.a
        .msg_send_expected(&self_addr, 11, vec![5, 5], send_cb)
        .expect("post send");

    drive(&pair.a);
    drive(&pair.a);

    assert!(send_rx.try_recv().is_ok());
    let done = recv_rx.try_recv().expect("self delivery");
    assert_eq!(done.actual_size, 2);
    assert!(done.source.expect("source").is_self());
}

#[test]
fn cancel_dequeues_an_undelivered_post() {
    let pair = pair();
    let a_addr = lookup(&pair.b, "loop://a");

    let (recv_cb, recv_rx) = capture();
    let op = pair
        .b
        .msg_recv_expected(&a_addr, 9, vec![0_u8; 8], recv_cb)
        .expect("post receive");

    // An address with queued state refuses to be freed.
    assert_eq!(pair.b.addr_free(&a_addr), Err(Error::Protocol));

    pair.b.cancel(op).expect("cancel posted receive");
    let done = recv_rx.try_recv().expect("cancellation completion");
    assert!(done.canceled);
    assert_eq!(done.result, Err(Error::Fail));
    assert_eq!(done.actual_size, 0);

    // Already gone: a second cancel finds nothing.
    assert_eq!(pair.b.cancel(op), Err(Error::NoMatch));

    // Drained now, so the address can be freed.
    pair.b.addr_free(&a_addr).expect("free drained address");

    drop(pair.fabric);
}
