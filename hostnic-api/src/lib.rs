pub mod backend {
    pub mod v1 {
        tonic::include_proto!("rpc.backend.v1");
    }
}
