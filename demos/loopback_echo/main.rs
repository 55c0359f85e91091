use std::any::Any;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use fabric_rpc::net::loopback::LoopbackFabric;
use fabric_rpc::net::{Completion, Endpoint, Transport};
use fabric_rpc::rpc::header::{
    RequestHeader, ResponseHeader, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};
use fabric_rpc::rpc::proc::{read_bytes, write_bytes, DecodeOp, Encoder};
use fabric_rpc::rpc::Runtime;
use fabric_rpc::Error;

fn encode_string(enc: &mut Encoder, value: &dyn Any) -> Result<(), Error> {
    let s = value.downcast_ref::<String>().ok_or(Error::InvalidParam)?;
    write_bytes(enc, s.as_bytes())
}

fn decode_string(op: &mut DecodeOp<'_, '_>, value: &mut dyn Any) -> Result<(), Error> {
    let s = value.downcast_mut::<String>().ok_or(Error::InvalidParam)?;
    match op {
        DecodeOp::Decode(dec) => {
            *s = String::from_utf8(read_bytes(dec)?).map_err(|_| Error::Protocol)?;
            Ok(())
        }
        DecodeOp::Release => {
            *s = String::new();
            Ok(())
        }
    }
}

/// Serves `echo` at the network abstraction level: receive the request,
/// send its payload straight back under the same tag.
fn serve_one_echo(ep: &Arc<Endpoint>) {
    let (tx, rx) = channel::<Completion>();
    ep.msg_recv_unexpected(vec![0_u8; ep.max_unexpected_size()], Box::new(move |c| {
        tx.send(c).ok();
    }))
    .expect("post unexpected receive");

    let request = loop {
        match ep.progress(Duration::from_millis(100)) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => panic!("responder progress failed: {e}"),
        }
        if let Ok(completion) = rx.try_recv() {
            break completion;
        }
    };

    let source = request.source.expect("request source");
    let buffer = request.buffer.expect("request payload");
    let data = &buffer[..request.actual_size];
    let header = RequestHeader::decode(data).expect("request header");

    let mut response = vec![0_u8; RESPONSE_HEADER_SIZE];
    ResponseHeader::new(header.id, Ok(())).encode(&mut response).expect("response header");
    response.extend_from_slice(&data[REQUEST_HEADER_SIZE..]);
    ep.msg_send_expected(&source, request.tag, response, Box::new(|_| {}))
        .expect("post response");

    // Drain our own send completion before going away.
    while ep.progress(Duration::from_millis(100)).is_ok() {}
}

/// Forwards one echo call across an in-process loopback fabric.
fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let fabric = LoopbackFabric::new();
    let server_transport = fabric.open("server").expect("open server endpoint");
    let responder = std::thread::spawn(move || {
        let ep = Arc::new(Endpoint::new(server_transport as Arc<dyn Transport>));
        serve_one_echo(&ep);
    });

    let transport = fabric.open("client").expect("open client endpoint");
    let rt = Runtime::init(transport as Arc<dyn Transport>).expect("init runtime");
    let echo = rt.register("echo", encode_string, decode_string).expect("register echo");

    let (tx, rx) = channel();
    rt.addr_lookup("loop://server", move |result| {
        tx.send(result).ok();
    })
    .expect("post lookup");
    let addr = rx.recv().expect("lookup completes").expect("lookup succeeds");

    let request = rt
        .forward(&addr, echo, &"hello fabric".to_string(), Box::new(String::new()))
        .expect("forward");
    rt.wait(&request, Duration::from_secs(1)).expect("wait");

    let out = request.with_output(|s: &String| s.clone()).expect("output");
    println!("echoed: {out}");
    rt.request_free(request).expect("free request");

    responder.join().expect("responder thread");
    rt.finalize().expect("finalize");
}
