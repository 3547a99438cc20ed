//! End-to-end echo-TCP round trip.

use std::time::{Duration, Instant};

use cat::net::{Socket, SimpleType};

fn drain(limit: Duration) {
    let start = Instant::now();
    while cat::event_wait(Some(Duration::from_millis(20))).is_ok() && start.elapsed() < limit {}
}

#[test]
fn echo_then_reset_then_liveness_drops() {
    let server = Socket::create(SimpleType::Tcp).unwrap();
    server.bind("127.0.0.1:0", true, false).unwrap();
    server.listen(128).unwrap();
    let addr = server.local_addr().unwrap().as_ip().unwrap().port();

    cat::spawn(move || {
        let conn = server.accept(-1).unwrap();
        let mut buf = [0u8; 64];

        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING");
        conn.write(&buf[..n]).unwrap();

        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"RESET");
        conn.close();
    });

    let client = Socket::create(SimpleType::Tcp).unwrap();
    let client_done = std::rc::Rc::new(std::cell::RefCell::new(false));
    let done2 = client_done.clone();
    cat::spawn(move || {
        client.connect("127.0.0.1", addr, -1).unwrap();
        client.write(b"PING").unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING");

        client.write(b"RESET").unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0, "expected EOF after the server closed");
        assert!(!client.check_liveness());
        *done2.borrow_mut() = true;
    });

    drain(Duration::from_secs(2));
    assert!(*client_done.borrow());
}
