//! Production implementations of the pool's seam traits
//!
//! Thin newtypes binding the pool's `Refresher`/`Upstream` seams to the
//! real identity-provider client and streaming transport. Tests inside
//! the pool crate substitute scripted implementations; this module is the
//! only place the production wiring happens.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use warp_auth::{AuthRefresher, RefreshError, RefreshGrant};
use warp_codec::EventStream;
use warp_pool::{Refresher, Upstream};
use warp_transport::{TransportError, WarpTransport};

pub struct PoolRefresher(pub AuthRefresher);

impl Refresher for PoolRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshGrant, RefreshError>> + Send + 'a>> {
        Box::pin(self.0.refresh(refresh_token))
    }
}

pub struct PoolUpstream(pub WarpTransport);

impl Upstream for PoolUpstream {
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        request: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, TransportError>> + Send + 'a>> {
        Box::pin(self.0.send(access_token, request))
    }
}
