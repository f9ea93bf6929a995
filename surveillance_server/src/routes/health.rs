use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct ModelsLoaded {
    yolo: &'static str,
    vit: &'static str,
}

#[derive(Serialize)]
pub struct Banner {
    service: &'static str,
    status: &'static str,
    models: ModelsLoaded,
}

#[derive(Serialize)]
pub struct Status {
    status: &'static str,
    device: String,
}

pub async fn root(State(state): State<SharedState>) -> Json<Banner> {
    let info = state.model_info();
    Json(Banner {
        service: "Military Surveillance API",
        status: "operational",
        models: ModelsLoaded {
            yolo: info.yolo,
            vit: info.vit,
        },
    })
}

pub async fn healthcheck(State(state): State<SharedState>) -> Json<Status> {
    Json(Status {
        status: "ok",
        device: state.models.device.clone(),
    })
}
