//! WeChat Pay notification middleware for Actix Web.
//!
//! WeChat Pay posts its notifications as a flat XML document, signed with the merchant API key (see
//! [`crate::integrations::wechat`]). This middleware reads the body, parses it and checks the signature before the
//! handler runs.
//!
//! * A body that cannot be read or parsed, or that fails the signature check, is answered directly with WeChat's
//!   `FAIL` XML reply. The handler is never called.
//! * Otherwise the parsed fields are stored in the request extensions as a [`WechatNotification`] and the original
//!   body is put back for the handler.

use std::{
    collections::BTreeMap,
    future::{ready, Ready},
    rc::Rc,
};

use actix_http::h1;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    web,
    Error,
    HttpMessage,
    HttpResponse,
};
use futures::future::LocalBoxFuture;
use log::{trace, warn};
use mpg_common::Secret;

use crate::integrations::wechat::{parse_xml, reply_xml, verify};

/// The verified fields of a WeChat Pay notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WechatNotification(pub BTreeMap<String, String>);

impl WechatNotification {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

pub struct WechatSignatureFactory {
    key: Secret<String>,
}

impl WechatSignatureFactory {
    pub fn new(key: Secret<String>) -> Self {
        WechatSignatureFactory { key }
    }
}

impl<S, B> Transform<S, ServiceRequest> for WechatSignatureFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;
    type InitError = ();
    type Response = ServiceResponse<EitherBody<B>>;
    type Transform = WechatSignatureService<S>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(WechatSignatureService { key: self.key.clone(), service: Rc::new(service) }))
    }
}

pub struct WechatSignatureService<S> {
    key: Secret<String>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for WechatSignatureService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = ServiceResponse<EitherBody<B>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let key = self.key.clone();
        Box::pin(async move {
            trace!("🔐️ Checking WeChat Pay signature for request");
            let data = match req.extract::<web::Bytes>().await {
                Ok(data) => data,
                Err(e) => {
                    warn!("🔐️ Failed to read WeChat Pay notification body: {e}");
                    return Ok(reject(req, "Could not read the request body"));
                },
            };
            let parsed =
                std::str::from_utf8(&data).map_err(|e| e.to_string()).and_then(|s| parse_xml(s).map_err(|e| e.to_string()));
            let params = match parsed {
                Ok(params) => params,
                Err(e) => {
                    warn!("🔐️ Malformed WeChat Pay notification: {e}");
                    return Ok(reject(req, "Malformed XML"));
                },
            };
            if let Err(e) = verify(&params, &key) {
                warn!("🔐️ WeChat Pay notification rejected. {e}");
                return Ok(reject(req, "Invalid signature"));
            }
            trace!("🔐️ WeChat Pay signature check ✅️");
            req.extensions_mut().insert(WechatNotification(params));
            req.set_payload(bytes_to_payload(data));
            service.call(req).await.map(ServiceResponse::map_into_left_body)
        })
    }
}

fn reject<B>(req: ServiceRequest, message: &str) -> ServiceResponse<EitherBody<B>> {
    let response = HttpResponse::Ok().content_type("text/xml").body(reply_xml(false, message));
    req.into_response(response).map_into_right_body()
}

fn bytes_to_payload(buf: web::Bytes) -> Payload {
    let (_, mut pl) = h1::Payload::create(true);
    pl.unread_data(buf);
    Payload::from(pl)
}
