use std::{collections::BTreeMap, net::IpAddr};

use membership_engine::db_types::{Order, OutTradeNo, PaymentMethod};
use mockall::mock;

use crate::integrations::{PayChannel, PaymentProvider, PaymentRequest, ProviderError, TradeQueryResult};

mock! {
    pub Alipay {}
    impl PaymentProvider for Alipay {
        fn payment_method(&self) -> PaymentMethod;
        fn verify_notification(&self, params: &BTreeMap<String, String>) -> Result<(), ProviderError>;
        async fn query_trade(&self, out_trade_no: &OutTradeNo) -> Result<TradeQueryResult, ProviderError>;
        async fn request_payment(
            &self,
            order: &Order,
            channel: PayChannel,
            client_ip: IpAddr,
        ) -> Result<PaymentRequest, ProviderError>;
    }
}

mock! {
    pub Wechat {}
    impl PaymentProvider for Wechat {
        fn payment_method(&self) -> PaymentMethod;
        fn verify_notification(&self, params: &BTreeMap<String, String>) -> Result<(), ProviderError>;
        async fn query_trade(&self, out_trade_no: &OutTradeNo) -> Result<TradeQueryResult, ProviderError>;
        async fn request_payment(
            &self,
            order: &Order,
            channel: PayChannel,
            client_ip: IpAddr,
        ) -> Result<PaymentRequest, ProviderError>;
    }
}
