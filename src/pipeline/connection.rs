//! Drives one HTTP/1 pipeline over a byte stream.
//!
//! The task owns the pipeline and is the only thing that touches it: socket
//! reads, completed deferred work and drain-state changes are all fed in
//! from one `select!` loop.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::engine::Pipeline;
use super::message::Inbound;
use crate::net::connection::DrainState;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Completed deferred items waiting for the connection task. Producers wait
/// when it is full, which holds streaming bodies back while the socket is
/// slow.
const DEFERRED_CAPACITY: usize = 32;

/// Runs `pipeline` until it asks to close, the peer goes away, or the drain
/// state becomes [`DrainState::ForceClose`].
pub async fn drive<IO>(
    io: IO,
    mut pipeline: Pipeline,
    mut drain: watch::Receiver<DrainState>,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let (tx, mut rx) = mpsc::channel(DEFERRED_CAPACITY);
    let mut tasks = JoinSet::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut reading = true;
    let mut watching = true;
    let mut quiesced = false;

    let result = loop {
        for spawned in pipeline.take_spawns() {
            tasks.spawn(spawned.forward(tx.clone()));
        }
        if let Some(bytes) = pipeline.take_outgoing() {
            if let Err(error) = writer.write_all(&bytes).await {
                break Err(error);
            }
            if let Err(error) = writer.flush().await {
                break Err(error);
            }
        }
        if pipeline.should_close() {
            break Ok(());
        }

        let state = *drain.borrow_and_update();
        match state {
            DrainState::ForceClose => break Ok(()),
            DrainState::Draining if !quiesced => {
                quiesced = true;
                pipeline.fire_inbound(Inbound::Quiesce);
                continue;
            }
            _ => {}
        }

        buf.reserve(READ_BUFFER_SIZE);
        tokio::select! {
            read = reader.read_buf(&mut buf), if reading => match read {
                Ok(0) => {
                    reading = false;
                    pipeline.fire_inbound(Inbound::Eof);
                }
                Ok(_) => pipeline.fire_inbound(Inbound::Bytes(buf.split().freeze())),
                Err(error) => break Err(error),
            },
            Some(deferred) = rx.recv() => pipeline.inject(deferred),
            changed = drain.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
            }
            Some(joined) = tasks.join_next() => {
                if let Err(error) = joined {
                    if error.is_panic() {
                        tracing::warn!("Deferred work panicked; closing connection");
                        break Ok(());
                    }
                }
            }
        }
    };

    tasks.abort_all();
    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::engine::{Context, Handler};
    use crate::pipeline::message::Outbound;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::io::duplex;

    /// Answers every read with the same bytes, later, from spawned work.
    struct DelayedEcho;

    impl Handler for DelayedEcho {
        fn name(&self) -> &'static str {
            "delayed-echo"
        }

        fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
            match msg {
                Inbound::Bytes(bytes) => {
                    let work = futures_util::stream::once(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(Outbound::Bytes(bytes))
                    });
                    ctx.spawn(work.boxed());
                }
                Inbound::Eof => ctx.close(),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn echoes_through_deferred_work_and_closes_on_eof() {
        let (client, server) = duplex(1024);
        let (_drain_tx, drain_rx) = watch::channel(DrainState::Running);
        let task = tokio::spawn(drive(server, Pipeline::new(vec![Box::new(DelayedEcho)]), drain_rx));

        let (mut read, mut write) = tokio::io::split(client);
        write.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        read.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        write.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn force_close_ends_the_task() {
        let (_client, server) = duplex(1024);
        let (drain_tx, drain_rx) = watch::channel(DrainState::Running);
        let task = tokio::spawn(drive(server, Pipeline::new(vec![Box::new(DelayedEcho)]), drain_rx));

        drain_tx.send_replace(DrainState::ForceClose);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connection task did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn quiesce_is_delivered_once_when_draining() {
        struct QuiesceCloses;

        impl Handler for QuiesceCloses {
            fn name(&self) -> &'static str {
                "quiesce-closes"
            }

            fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
                if let Inbound::Quiesce = msg {
                    ctx.fire_outbound(Outbound::Bytes(Bytes::from_static(b"bye")));
                    ctx.close();
                }
            }
        }

        let (mut client, server) = duplex(1024);
        let (drain_tx, drain_rx) = watch::channel(DrainState::Running);
        let task = tokio::spawn(drive(server, Pipeline::new(vec![Box::new(QuiesceCloses)]), drain_rx));

        drain_tx.send_replace(DrainState::Draining);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        task.await.unwrap().unwrap();
    }
}
