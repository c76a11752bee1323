use spw_rmap::{
    prelude::*,
    transport::tcp::{
        encode_packet,
        Flag,
        FrameHeader,
        HEADER_LEN,
    },
};
use std::{
    io::{
        ErrorKind,
        Read,
        Write,
    },
    net::{
        SocketAddr,
        TcpListener,
        TcpStream,
    },
    sync::mpsc::{
        self,
        Receiver,
        Sender,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

fn node() -> TargetNode {
    TargetNode::new(0x34, vec![], vec![]).unwrap()
}

fn config() -> Config {
    Config::default()
        .with_read_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(10))
}

fn read_unit(stream: &mut TcpStream) -> anyhow::Result<Option<(FrameHeader, Vec<u8>)>> {
    let mut raw = [0u8; HEADER_LEN];
    match stream.read_exact(&mut raw) {
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        other => other?,
    }
    let header = FrameHeader::from_bytes(&raw)?;
    let mut payload = vec![0u8; usize::try_from(header.length)?];
    stream.read_exact(&mut payload)?;
    Ok(Some((header, payload)))
}

fn unit(flag: Flag, payload: &[u8]) -> Vec<u8> {
    let mut bytes = FrameHeader::new(flag, payload.len()).to_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

/// Send a reply the hard way: a time-code, an aborted packet, then the reply in two fragments
fn scrambled(reply: &[u8]) -> Vec<u8> {
    let (head, tail) = reply.split_at(reply.len() / 2);
    let mut bytes = unit(Flag::TimecodeIn, &[0x2A, 0x00]);
    bytes.extend(unit(Flag::Eep, &[0xFE, 0x01, 0x0D]));
    bytes.extend(unit(Flag::Fragment, head));
    bytes.extend(unit(Flag::Eop, tail));
    bytes
}

/// A bridge with a simulated target behind it, serving a single connection
struct Bridge {
    addr: SocketAddr,
    timecodes: Receiver<u8>,
    handle: JoinHandle<anyhow::Result<()>>,
}

fn serve(
    listener: TcpListener,
    mut target: TargetMemory,
    scramble: bool,
    timecodes: Sender<u8>,
) -> anyhow::Result<()> {
    let (mut stream, _) = listener.accept()?;
    while let Some((header, payload)) = read_unit(&mut stream)? {
        match header.flag {
            Flag::Eop => {
                if let Some(reply) = target.handle(&payload) {
                    let bytes = if scramble {
                        scrambled(&reply)
                    } else {
                        encode_packet(&reply)
                    };
                    stream.write_all(&bytes)?;
                }
            }
            Flag::TimecodeOut => timecodes.send(payload[0])?,
            _ => anyhow::bail!("unexpected unit {header:?}"),
        }
    }
    Ok(())
}

fn bridge(target: TargetMemory, scramble: bool) -> anyhow::Result<Bridge> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let (tx, timecodes) = mpsc::channel();
    let handle = thread::spawn(move || serve(listener, target, scramble, tx));
    Ok(Bridge {
        addr,
        timecodes,
        handle,
    })
}

#[test]
fn write_read_over_tcp() -> anyhow::Result<()> {
    let bridge = bridge(TargetMemory::new(0x34, 0), false)?;
    let initiator = Initiator::connect(bridge.addr, config())?;
    initiator.write_value(&node(), 0x44A2_0038, &0x0000_012Cu32)?;
    assert_eq!(
        initiator.read(&node(), 0x44A2_0038, 4)?,
        vec![0x00, 0x00, 0x01, 0x2C]
    );
    initiator.close()?;
    bridge.handle.join().unwrap()?;
    Ok(())
}

#[test]
fn fragments_and_noise() -> anyhow::Result<()> {
    let mut target = TargetMemory::new(0x34, 0);
    target.poke(0x100, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let bridge = bridge(target, true)?;
    let initiator = Initiator::connect(bridge.addr, config())?;
    assert_eq!(
        initiator.read(&node(), 0x100, 8)?,
        vec![1, 2, 3, 4, 5, 6, 7, 8]
    );
    initiator.write(&node(), 0x100, &[9])?;
    assert_eq!(initiator.read_value::<u8>(&node(), 0x100)?, 9);
    drop(initiator);
    bridge.handle.join().unwrap()?;
    Ok(())
}

#[test]
fn timecodes_reach_the_bridge() -> anyhow::Result<()> {
    let bridge = bridge(TargetMemory::new(0x34, 0), false)?;
    let initiator = Initiator::connect(bridge.addr, config())?;
    initiator.emit_timecode(0x41)?;
    assert_eq!(
        bridge.timecodes.recv_timeout(Duration::from_secs(5))?,
        0x01
    );
    drop(initiator);
    bridge.handle.join().unwrap()?;
    Ok(())
}

#[test]
fn fixed_buffers_refuse_large_frames() -> anyhow::Result<()> {
    let bridge = bridge(TargetMemory::new(0x34, 0), false)?;
    let config = config()
        .with_buffers(64, 4096)
        .with_buffer_policy(BufferPolicy::Fixed);
    let initiator = Initiator::connect(bridge.addr, config)?;
    let err = initiator.write(&node(), 0, &[0u8; 128]).unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(!err.is_fatal());
    assert_eq!(initiator.pending(), 0);
    // Nothing went out, so the session carries on
    initiator.write(&node(), 0, &[1, 2, 3, 4])?;
    assert_eq!(initiator.read(&node(), 0, 4)?, vec![1, 2, 3, 4]);
    drop(initiator);
    bridge.handle.join().unwrap()?;
    Ok(())
}

#[test]
fn bridge_hangup_fails_pending() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    // Swallow one command, then hang up
    let handle = thread::spawn(move || -> anyhow::Result<()> {
        let (mut stream, _) = listener.accept()?;
        read_unit(&mut stream)?;
        Ok(())
    });
    let initiator = Initiator::connect(addr, config().with_read_timeout(Duration::from_secs(5)))?;
    assert!(matches!(
        initiator.read(&node(), 0, 4),
        Err(Error::Connection(_))
    ));
    handle.join().unwrap()?;
    Ok(())
}

#[test]
fn connect_refused() -> anyhow::Result<()> {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    assert!(matches!(
        Initiator::connect(addr, config()),
        Err(Error::Connection(_))
    ));
    Ok(())
}
