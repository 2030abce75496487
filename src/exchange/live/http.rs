use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BookUpdate, ExchangeClient};
use crate::exchange::{Balance, FeeCurrency, OrderId, OrderSide, OrderStatus};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaceOrderRequest {
    pub side: OrderSide,
    pub volume: f64,
    pub limit_price: Option<f64>,
    pub fee_currency: FeeCurrency,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaceOrderResponse {
    pub order_id: OrderId,
}

/// Client for a JSON gateway sitting in front of a venue. Authentication and venue specifics live
/// behind the gateway; this only speaks its small REST surface.
#[derive(Debug, Clone)]
pub struct HttpExchangeClient {
    pub path: String,
    pub client: reqwest::Client,
}

impl HttpExchangeClient {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn place(&self, req: PlaceOrderRequest) -> Result<OrderId> {
        Ok(self
            .client
            .post(self.path.clone() + "/orders")
            .json(&req)
            .send()
            .await?
            .error_for_status()?
            .json::<PlaceOrderResponse>()
            .await?
            .order_id)
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn fetch_order_book(&self) -> Result<BookUpdate> {
        Ok(self
            .client
            .get(self.path.clone() + "/depth")
            .send()
            .await?
            .error_for_status()?
            .json::<BookUpdate>()
            .await?)
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        Ok(self
            .client
            .get(self.path.clone() + "/balance")
            .send()
            .await?
            .error_for_status()?
            .json::<Balance>()
            .await?)
    }

    async fn submit_market_order(
        &self,
        side: OrderSide,
        volume: f64,
        fee_currency: FeeCurrency,
    ) -> Result<OrderId> {
        self.place(PlaceOrderRequest {
            side,
            volume,
            limit_price: None,
            fee_currency,
        })
        .await
    }

    async fn submit_limit_order(
        &self,
        side: OrderSide,
        volume: f64,
        limit_price: f64,
        fee_currency: FeeCurrency,
    ) -> Result<OrderId> {
        self.place(PlaceOrderRequest {
            side,
            volume,
            limit_price: Some(limit_price),
            fee_currency,
        })
        .await
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        self.client
            .post(self.path.clone() + format!("/orders/{order_id}/cancel").as_str())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn fetch_order(&self, order_id: OrderId) -> Result<OrderStatus> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/orders/{order_id}").as_str())
            .send()
            .await?
            .error_for_status()?
            .json::<OrderStatus>()
            .await?)
    }
}
