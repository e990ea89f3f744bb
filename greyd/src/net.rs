use std::{
	future::Future,
	net::SocketAddr,
	sync::{Arc, Mutex},
};

use grey::{Policy, RequestReader, Response};
use tokio::{
	io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
	net::TcpListener,
	sync::watch,
	task::JoinSet,
};

/// One policy shared by every session. Sessions take turns with it, so
/// decisions never interleave.
pub type SharedPolicy = Arc<Mutex<dyn Policy>>;

// Runs until the peer stops sending or shutdown is signalled. Reads lines,
// hands every complete request to the policy and writes the answer back.
pub async fn serve<R, W>(
	reader: R,
	mut writer: W,
	policy: SharedPolicy,
	mut rx: watch::Receiver<bool>,
) -> io::Result<()>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut lines = reader.lines();
	let mut requests = RequestReader::new();

	loop {
		let line = tokio::select! {
			_ = rx.changed() => return Ok(()),
			line = lines.next_line() => line?,
		};

		let line = match line {
			Some(line) => line,
			None => {
				if requests.is_partial() {
					tracing::warn!("peer went away in the middle of a request");
				}
				return Ok(());
			}
		};

		let response = match requests.push(&line) {
			Ok(None) => continue,
			Ok(Some(request)) => with_policy(&policy, move |p| p.evaluate(&request)).await?,
			Err(err) => with_policy(&policy, move |p| p.reject(&err)).await?,
		};

		write_response(&mut writer, &response).await?;

		// The peer has its answer, cleanup can take as long as it likes
		with_policy(&policy, |p| p.housekeeping()).await?;
	}
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> io::Result<()> {
	writer.write_all(response.as_string().as_bytes()).await?;
	writer.flush().await
}

// The policy does blocking database work, keep it off the reactor
async fn with_policy<T, F>(policy: &SharedPolicy, f: F) -> io::Result<T>
where
	F: FnOnce(&mut dyn Policy) -> T + Send + 'static,
	T: Send + 'static,
{
	let policy = policy.clone();

	tokio::task::spawn_blocking(move || {
		let mut guard = policy
			.lock()
			.map_err(|_| io::Error::new(io::ErrorKind::Other, "policy lock poisoned"))?;
		Ok(f(&mut *guard))
	})
	.await
	.map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

//waits for new connections, dispatches new task to handle each new inbound connection
pub async fn listen(listener: TcpListener, policy: SharedPolicy, rx: watch::Receiver<bool>) {
	let listener = &listener;
	accept_loop(move || listener.accept(), policy, rx).await
}

async fn accept_loop<A, F, S>(mut accept: A, policy: SharedPolicy, mut rx: watch::Receiver<bool>)
where
	A: FnMut() -> F,
	F: Future<Output = io::Result<(S, SocketAddr)>>,
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	let mut sessions = JoinSet::new();

	loop {
		let (stream, clientaddr) = tokio::select! {
			_ = rx.changed() => break,
			accepted = accept() => match accepted {
				Ok(accepted) => accepted,
				Err(err) => {
					// One refused connection doesn't stop the others
					tracing::warn!("failed to accept a connection: {}", err);
					continue;
				}
			}
		};

		tracing::debug!("connection from {}", clientaddr);

		let policy = policy.clone();
		let rx = rx.clone();

		sessions.spawn(async move {
			let (read, write) = io::split(stream);
			if let Err(err) = serve(BufReader::new(read), write, policy, rx).await {
				tracing::warn!("session with {} failed: {}", clientaddr, err);
			}
		});

		// Reap the sessions that are already done
		while sessions.try_join_next().is_some() {}
	}

	while sessions.join_next().await.is_some() {}
}

#[cfg(test)]
mod test {
	use grey::{Request, RequestError};
	use tokio::io::{duplex, AsyncReadExt};

	use super::*;

	/// Answers with the sender it saw, and counts the cleanups
	#[derive(Default)]
	struct Echo {
		housekeeping: usize,
	}

	impl Policy for Echo {
		fn evaluate(&mut self, request: &Request) -> Response {
			Response::new(format!("action=echo {}", request.get("sender").unwrap_or("-")))
		}

		fn reject(&mut self, _: &RequestError) -> Response {
			Response::new("action=defer_if_permit bad request")
		}

		fn housekeeping(&mut self) {
			self.housekeeping += 1;
		}
	}

	async fn session(input: &'static [u8]) -> (String, usize) {
		let echo = Arc::new(Mutex::new(Echo::default()));
		let policy: SharedPolicy = echo.clone();
		let (_tx, rx) = watch::channel(false);
		let (mut ours, theirs) = duplex(4096);

		let (read, write) = io::split(theirs);
		let task = tokio::spawn(serve(BufReader::new(read), write, policy, rx));

		ours.write_all(input).await.unwrap();
		ours.shutdown().await.unwrap();

		let mut out = String::new();
		ours.read_to_string(&mut out).await.unwrap();
		task.await.unwrap().unwrap();

		let count = echo.lock().unwrap().housekeeping;
		(out, count)
	}

	#[tokio::test]
	async fn answers_each_request() {
		let (out, housekeeping) = session(
			b"request=smtpd_access_policy\nsender=a@x\n\n\
			request=smtpd_access_policy\r\nsender=b@x\r\n\r\n",
		)
		.await;

		assert_eq!(out, "action=echo a@x\n\naction=echo b@x\n\n");
		assert_eq!(housekeeping, 2);
	}

	#[tokio::test]
	async fn rejects_bad_requests_and_carries_on() {
		let (out, _) = session(b"sender=a@x\nnonsense\n\nsender=c@x\n\n").await;

		assert_eq!(out, "action=defer_if_permit bad request\n\naction=echo c@x\n\n");
	}

	#[tokio::test]
	async fn unfinished_request_gets_no_answer() {
		let (out, housekeeping) = session(b"\nsender=a@x\n").await;

		assert_eq!(out, "");
		assert_eq!(housekeeping, 0);
	}

	#[tokio::test]
	async fn stops_on_shutdown() {
		let policy: SharedPolicy = Arc::new(Mutex::new(Echo::default()));
		let (tx, rx) = watch::channel(false);
		let (_ours, theirs) = duplex(64);
		let (read, write) = io::split(theirs);

		let task = tokio::spawn(serve(BufReader::new(read), write, policy, rx));
		tx.send(true).unwrap();

		task.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn listens_over_tcp() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let policy: SharedPolicy = Arc::new(Mutex::new(Echo::default()));
		let (tx, rx) = watch::channel(false);
		let server = tokio::spawn(listen(listener, policy, rx));

		let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
		stream.write_all(b"sender=z@x\n\n").await.unwrap();

		let mut buf = [0u8; 17];
		stream.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"action=echo z@x\n\n");

		tx.send(true).unwrap();
		server.await.unwrap();
	}

	#[tokio::test]
	async fn keeps_accepting_after_a_failed_accept() {
		let (conns, queue) = tokio::sync::mpsc::unbounded_channel();
		let queue = Arc::new(tokio::sync::Mutex::new(queue));
		let accept = move || {
			let queue = queue.clone();
			async move {
				match queue.lock().await.recv().await {
					Some(next) => next,
					None => std::future::pending().await,
				}
			}
		};

		let (mut ours, theirs) = duplex(256);
		let peer: SocketAddr = "192.0.2.1:40000".parse().unwrap();
		conns
			.send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted")))
			.unwrap();
		conns.send(Ok((theirs, peer))).unwrap();

		let policy: SharedPolicy = Arc::new(Mutex::new(Echo::default()));
		let (tx, rx) = watch::channel(false);
		let server = tokio::spawn(accept_loop(accept, policy, rx));

		ours.write_all(b"sender=z@x\n\n").await.unwrap();
		let mut buf = [0u8; 17];
		ours.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"action=echo z@x\n\n");

		tx.send(true).unwrap();
		server.await.unwrap();
	}
}
