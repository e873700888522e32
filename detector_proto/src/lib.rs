tonic::include_proto!("detector");
