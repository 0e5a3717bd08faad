// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tokio task utilities.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// The name is computed lazily and attached to the task as a tracing span, so
/// log lines emitted by the task can be attributed to it.
///
/// Unlike [`tokio::spawn`], the returned [`JoinHandle`] resolves directly to
/// the task's output: a panic inside the task is resumed in whichever task
/// awaits the handle. Dropping the handle detaches the task; it is not
/// cancelled.
#[track_caller]
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::debug_span!("task", name = name.as_ref());
    JoinHandle {
        inner: tokio::spawn(future.instrument(span)),
    }
}

/// A handle to a task spawned with [`spawn`].
#[derive(Debug)]
pub struct JoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Cancels the task.
    pub fn abort(&self) {
        self.inner.abort()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        Pin::new(&mut self.inner).poll(cx).map(|res| match res {
            Ok(output) => output,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // Only reachable after `abort` or runtime shutdown, neither of
            // which leaves anyone around who expects an output.
            Err(err) => panic!("awaited a cancelled task: {err}"),
        })
    }
}
