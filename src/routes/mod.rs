use warp::Filter;

use crate::member::MemberHandle;
use crate::transport::MeshTransport;

pub mod mesh;
pub mod query;
pub mod sse;

pub fn routes(
  handle: MemberHandle,
  transport: MeshTransport,
) -> impl Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
  mesh::mesh_route(transport)
    .or(query::query_route(handle.clone()))
    .or(query::health_route(handle.clone()))
    .or(sse::events_route(handle))
    .recover(query::handle_rejection)
}
