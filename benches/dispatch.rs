use criterion::{criterion_group, criterion_main, Criterion};
use roomcall::call::CallSessionMachine;
use roomcall::signaling::{IceCandidate, RoomId, Signal, SignalEnvelope, User};

fn bench_envelope_dispatch(c: &mut Criterion) {
    let room = RoomId::new("bench");
    let remote = User::generate("remote");
    let local = User::generate("local");

    let candidate = SignalEnvelope::new(
        Signal::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.10 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }),
        &room,
        &remote,
    )
    .to_json()
    .expect("encode candidate");
    let ping = SignalEnvelope::new(Signal::Ping, &room, &remote)
        .to_json()
        .expect("encode ping");

    c.bench_function("decode_candidate_envelope", |b| {
        b.iter(|| {
            let _ = SignalEnvelope::from_json(&candidate).expect("decode candidate");
        })
    });

    let mut machine = CallSessionMachine::new();
    machine.join(local, room);
    c.bench_function("dispatch_presence_ping", |b| {
        b.iter(|| {
            let envelope = SignalEnvelope::from_json(&ping).expect("decode ping");
            let _ = machine.handle_envelope(&envelope);
        })
    });
}

criterion_group!(benches, bench_envelope_dispatch);
criterion_main!(benches);
